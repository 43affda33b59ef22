pub mod cache;
pub mod ehentai;
pub mod error;
pub mod gallery;
pub mod progress;
pub mod scheduler;
pub mod session;

#[cfg(test)]
mod test_support;
