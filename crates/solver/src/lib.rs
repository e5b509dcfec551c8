pub mod assembly;
pub mod config;
pub mod constraint;
pub mod error;
pub mod host;
pub mod hyperdual;
pub mod placement;
pub mod quaternion;
pub mod trust_region;
pub mod variable;

pub use assembly::*;
pub use config::*;
pub use constraint::*;
pub use error::*;
pub use host::*;
pub use hyperdual::*;
pub use placement::*;
pub use quaternion::*;
pub use trust_region::*;
pub use variable::*;
