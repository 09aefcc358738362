//! 数据源实现

pub mod picks_repository;

pub use picks_repository::FilePicksRepository;
