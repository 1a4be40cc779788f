//! Millisecond unix timestamps, used throughout session bookkeeping for
//! `created`/`used`/`closed` fields.

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
