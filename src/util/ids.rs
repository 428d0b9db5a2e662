//! Client-generated identifiers, 20 characters from the identifier
//! alphabet: a 9-character base-36 millisecond timestamp, a 3-character
//! slice of a process-wide sequence counter, and an 8-character random
//! tail. The timestamp prefix keeps ids roughly time-ordered across
//! processes; the sequence slice keeps ids generated within the same
//! millisecond strictly ordered inside one process; the random tail makes
//! collisions across processes implausible.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

const TIMESTAMP_CHARS: usize = 9;
const SEQUENCE_CHARS: usize = 3;
const RANDOM_CHARS: usize = 8;

const SEQUENCE_SPAN: u64 = 36 * 36 * 36;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

pub fn generate_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    compose_id(millis, sequence)
}

/// Event-ids correlate requests with their acks. They share the identifier
/// alphabet so they pass validation on the wire.
pub fn generate_event_id() -> String {
    generate_id()
}

fn compose_id(millis: u64, sequence: u64) -> String {
    let mut id = String::with_capacity(TIMESTAMP_CHARS + SEQUENCE_CHARS + RANDOM_CHARS);
    push_base36(&mut id, millis, TIMESTAMP_CHARS);
    push_base36(&mut id, sequence % SEQUENCE_SPAN, SEQUENCE_CHARS);
    let mut rng = rand::thread_rng();
    for _ in 0..RANDOM_CHARS {
        id.push(ALPHABET[rng.gen_range(0..ALPHABET.len())] as char);
    }
    id
}

/// Fixed-width base-36 rendering, most significant digit first. Values
/// wider than `width` digits keep only the low digits; nine digits of
/// base-36 cover millisecond timestamps for the next few millennia.
fn push_base36(out: &mut String, value: u64, width: usize) {
    for position in (0..width).rev() {
        let digit = (value / 36u64.pow(position as u32)) % 36;
        out.push(ALPHABET[digit as usize] as char);
    }
}
