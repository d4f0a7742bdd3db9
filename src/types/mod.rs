pub mod chart;
pub mod price;
pub mod session;
pub mod trading;
pub mod ws;

pub use chart::*;
pub use price::*;
pub use session::*;
pub use trading::*;
pub use ws::*;
