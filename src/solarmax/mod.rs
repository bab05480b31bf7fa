pub mod field;
pub mod frame;
pub mod model;
pub mod normalize;
pub mod registry;
pub mod session;

pub use field::QueryField;
pub use normalize::{NormalizedValue, Values};
pub use registry::{InverterInfo, InverterRegistry};
pub use session::{Session, SessionState, StatusReport};
