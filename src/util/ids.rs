use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const AUTO_ID_LENGTH: usize = 20;
const RANDOM_ID_LENGTH: usize = 11;

static LAST_TEMP_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Opaque locally generated identifier (base-36).
pub fn random_id() -> String {
    let mut rng = rand::thread_rng();
    (0..RANDOM_ID_LENGTH)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect()
}

/// Placeholder id handed out for records created while offline: `temp_<unix millis>`.
///
/// Strictly increasing within the process; two calls in the same millisecond get
/// consecutive values.
pub fn temp_id() -> String {
    let now = Utc::now().timestamp_millis();
    let mut last = LAST_TEMP_MILLIS.load(Ordering::SeqCst);
    loop {
        let next = now.max(last + 1);
        match LAST_TEMP_MILLIS.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return format!("temp_{next}"),
            Err(current) => last = current,
        }
    }
}

pub fn is_temp_id(id: &str) -> bool {
    id.strip_prefix("temp_")
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

/// Document id in the style assigned by the hosted database.
pub fn auto_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(AUTO_ID_LENGTH)
        .map(char::from)
        .collect()
}
