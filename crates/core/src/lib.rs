pub mod events;
pub mod models;
pub mod token;
pub mod traits;

pub use events::*;
pub use models::*;
pub use token::*;
pub use traits::*;
