pub mod activity;
pub mod bans;
