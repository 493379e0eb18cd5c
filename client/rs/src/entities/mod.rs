use typeshare::typeshare;

pub mod config;
pub mod deploy;
pub mod logs;
pub mod stats;

#[typeshare(serialized_as = "number")]
pub type I64 = i64;
#[typeshare(serialized_as = "number")]
pub type U64 = u64;
#[typeshare(serialized_as = "number")]
pub type Usize = usize;

/// Current wall clock formatted as RFC3339, used to fill log
/// timestamps when the source did not provide one.
pub fn rfc3339_now() -> String {
  chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}
