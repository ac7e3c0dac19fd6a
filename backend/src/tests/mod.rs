// Engine scenarios exercised through the in-memory runtime

pub mod fixtures;
mod scenarios;
