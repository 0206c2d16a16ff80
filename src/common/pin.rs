// Room PINs: 6 uppercase alphanumeric characters, case-insensitive on
// input. Normalized before any store interaction.
use rand::Rng;

pub const PIN_LEN: usize = 6;

const PIN_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Uppercase and trim user input before it ever reaches a query.
pub fn normalize(input: &str) -> String {
    input.trim().to_uppercase()
}

pub fn is_valid(pin: &str) -> bool {
    pin.len() == PIN_LEN && pin.bytes().all(|b| PIN_ALPHABET.contains(&b))
}

/// Client-side fallback generator, used when the store's unique-PIN
/// procedure fails. Carries a small collision probability with existing
/// PINs; that is accepted degraded-mode behavior.
pub fn random_pin() -> String {
    let mut rng = rand::thread_rng();
    (0..PIN_LEN)
        .map(|_| PIN_ALPHABET[rng.gen_range(0..PIN_ALPHABET.len())] as char)
        .collect()
}
