//! Time-ordered message keys.
//!
//! A key is 8 characters of millisecond timestamp followed by 12 random
//! characters, both drawn from an alphabet sorted in ASCII order, so keys
//! compare lexicographically in creation order. Keys produced by the same
//! generator are strictly increasing even within one millisecond or when
//! the wall clock steps backwards.
use chrono::{DateTime, Utc};
use rand::Rng;

use crate::models::MessageId;

const PUSH_CHARS: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

const TIME_LEN: usize = 8;
const RANDOM_LEN: usize = 12;

#[derive(Debug, Default)]
pub struct PushIdGenerator {
    last_millis: i64,
    last_random: [u8; RANDOM_LEN],
}

impl PushIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self, now: DateTime<Utc>) -> MessageId {
        let mut millis = now.timestamp_millis().max(0);

        if millis <= self.last_millis {
            millis = self.last_millis;
            if !increment(&mut self.last_random) {
                // 64^12 keys in one millisecond: move on to the next one
                millis += 1;
                self.fill_random();
            }
        } else {
            self.fill_random();
        }
        self.last_millis = millis;

        let mut key = [0u8; TIME_LEN + RANDOM_LEN];
        let mut remaining = millis;
        for slot in key[..TIME_LEN].iter_mut().rev() {
            *slot = PUSH_CHARS[(remaining % 64) as usize];
            remaining /= 64;
        }
        for (slot, digit) in key[TIME_LEN..].iter_mut().zip(self.last_random) {
            *slot = PUSH_CHARS[digit as usize];
        }

        MessageId::new(key.iter().map(|&b| b as char).collect::<String>())
    }

    fn fill_random(&mut self) {
        let mut rng = rand::rng();
        for digit in self.last_random.iter_mut() {
            *digit = rng.random_range(0..64);
        }
    }
}

/// Base-64 increment with carry. Returns false on overflow.
fn increment(digits: &mut [u8; RANDOM_LEN]) -> bool {
    for digit in digits.iter_mut().rev() {
        if *digit < 63 {
            *digit += 1;
            return true;
        }
        *digit = 0;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn keys_sort_by_creation() {
        let mut id_gen = PushIdGenerator::new();
        let t0 = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let t1 = Utc.timestamp_millis_opt(1_700_000_000_001).unwrap();

        let a = id_gen.next_id(t0);
        let b = id_gen.next_id(t0);
        let c = id_gen.next_id(t1);

        assert_eq!(a.as_str().len(), 20);
        assert!(a < b, "same millisecond keys must still increase");
        assert!(b < c);
    }

    #[test]
    fn clock_going_backwards_stays_monotonic() {
        let mut id_gen = PushIdGenerator::new();
        let later = Utc.timestamp_millis_opt(2_000_000).unwrap();
        let earlier = Utc.timestamp_millis_opt(1_000_000).unwrap();

        let a = id_gen.next_id(later);
        let b = id_gen.next_id(earlier);
        assert!(a < b);
    }

    #[test]
    fn increment_carries() {
        let mut digits = [0u8; RANDOM_LEN];
        digits[RANDOM_LEN - 1] = 63;
        assert!(increment(&mut digits));
        assert_eq!(digits[RANDOM_LEN - 1], 0);
        assert_eq!(digits[RANDOM_LEN - 2], 1);

        let mut full = [63u8; RANDOM_LEN];
        assert!(!increment(&mut full));
    }
}
