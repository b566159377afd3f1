pub mod broadcaster;
pub mod chat;
pub mod session;

pub use broadcaster::*;
pub use chat::*;
pub use session::*;
