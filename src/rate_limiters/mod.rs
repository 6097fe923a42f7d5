pub mod abuse_guard;

pub use abuse_guard::AbuseGuard;
