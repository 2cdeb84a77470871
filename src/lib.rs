pub mod net;
pub mod util;
