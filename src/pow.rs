//! Memory-hard Salsa20/12 + SHA-512 hashcash.

use rand::RngCore;
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::Salsa12;
use sha2::{Digest, Sha512};

/// Size of the keystream buffer each attempt must fill. Protocol constant.
pub const POW_BUFFER_SIZE: usize = 131_072;

/// Largest difficulty a peer may ask us to compute.
pub const POW_MAX_SERVED_DIFFICULTY: u8 = 14;

// Difficulty is a bit count over a SHA-512 digest.
const MAX_DIFFICULTY: u32 = 512;

// One hashcash round: digest the candidate, expand it through 128 KiB of
// Salsa20/12 keystream, digest that. The scratch buffer must be exactly
// POW_BUFFER_SIZE and is re-zeroed on every attempt.
fn round(candidate: &[u8], scratch: &mut [u8]) -> [u8; 64] {
    let seed = Sha512::digest(candidate);
    scratch.fill(0);
    let iv = [0u8; 8];
    let mut cipher = Salsa12::new(
        salsa20::Key::from_slice(&seed[..32]),
        salsa20::Nonce::from_slice(&iv),
    );
    cipher.apply_keystream(scratch);
    let digest = Sha512::digest(&scratch[..]);
    let mut out = [0u8; 64];
    out.copy_from_slice(&digest);
    out
}

fn leading_bits_zero(digest: &[u8; 64], difficulty: u32) -> bool {
    let mut d = difficulty;
    let mut i = 0usize;
    while d >= 8 {
        if digest[i] != 0 {
            return false;
        }
        i += 1;
        d -= 8;
    }
    if d > 0 && ((u32::from(digest[i]) << d) & 0xff00) != 0 {
        return false;
    }
    true
}

/// Find a 16-byte result whose hashcash digest has `difficulty` leading
/// zero bits over `challenge`.
///
/// The candidate is `result ‖ challenge`; the first 8 result bytes are
/// incremented as a little-endian counter from a random starting point.
pub fn compute(difficulty: u32, challenge: &[u8]) -> [u8; 16] {
    let difficulty = difficulty.min(MAX_DIFFICULTY);
    let mut scratch = vec![0u8; POW_BUFFER_SIZE];

    let mut candidate = vec![0u8; 16 + challenge.len()];
    rand::thread_rng().fill_bytes(&mut candidate[..16]);
    candidate[16..].copy_from_slice(challenge);

    loop {
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&candidate[..8]);
        let next = u64::from_le_bytes(counter).wrapping_add(1);
        candidate[..8].copy_from_slice(&next.to_le_bytes());

        let digest = round(&candidate, &mut scratch);
        if leading_bits_zero(&digest, difficulty) {
            let mut result = [0u8; 16];
            result.copy_from_slice(&candidate[..16]);
            return result;
        }
    }
}

/// Check a proposed 16-byte result against `challenge` at `difficulty`.
pub fn verify(difficulty: u32, challenge: &[u8], proposed: &[u8; 16]) -> bool {
    let difficulty = difficulty.min(MAX_DIFFICULTY);
    let mut scratch = vec![0u8; POW_BUFFER_SIZE];

    let mut candidate = vec![0u8; 16 + challenge.len()];
    candidate[..16].copy_from_slice(proposed);
    candidate[16..].copy_from_slice(challenge);

    let digest = round(&candidate, &mut scratch);
    leading_bits_zero(&digest, difficulty)
}
