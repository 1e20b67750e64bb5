pub mod adherence;
pub mod alerts;
pub mod analysis;
pub mod auth;
pub mod db;
pub mod models;
pub mod storage;
