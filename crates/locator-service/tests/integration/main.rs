mod persistence;
mod resolve;
mod utils;
