mod backbone;
mod common;
mod dpi;
