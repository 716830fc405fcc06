pub mod aggregator;
pub mod api;
pub mod clock;
pub mod config;
pub mod db;
pub mod reading_cache;
pub mod source;
pub mod summaries;
pub mod supabase;
