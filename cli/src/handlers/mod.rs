mod convert;

pub use convert::handle_convert;
