pub mod error;
pub mod types;
pub mod value;

pub use error::ScriptLangError;
pub use types::*;
pub use value::*;
