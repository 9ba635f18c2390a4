pub(crate) mod fixtures;
mod integration;
