pub mod plan;
pub mod traits;

pub use plan::{Band, Channel, ChannelPlan, DataRate};
pub use traits::{LoraStack, StackError, StackEvent, StackSession};
