pub mod bar;
pub mod regime;
pub mod wire;

pub use bar::*;
pub use regime::*;
pub use wire::*;
