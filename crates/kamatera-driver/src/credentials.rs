//! Random root passwords and server name suffixes.

use rand::Rng;
use rand::seq::SliceRandom;

const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const DIGITS: &[u8] = b"0123456789";

pub const PASSWORD_LEN: usize = 12;
const PASSWORD_DIGITS: usize = 3;
pub const NAME_SUFFIX_LEN: usize = 6;

fn pick<R: Rng + ?Sized>(rng: &mut R, charset: &[u8]) -> char {
    charset[rng.gen_range(0..charset.len())] as char
}

/// 12 alphanumeric characters with at least one uppercase letter and
/// three digits; no symbols or spaces.
pub fn generate_password() -> String {
    generate_password_with(&mut rand::thread_rng())
}

pub fn generate_password_with<R: Rng + ?Sized>(rng: &mut R) -> String {
    let letters: Vec<u8> = [UPPER, LOWER].concat();

    let mut chars = Vec::with_capacity(PASSWORD_LEN);
    chars.push(pick(rng, UPPER));
    for _ in 0..PASSWORD_DIGITS {
        chars.push(pick(rng, DIGITS));
    }
    while chars.len() < PASSWORD_LEN {
        chars.push(pick(rng, &letters));
    }
    chars.shuffle(rng);
    chars.into_iter().collect()
}

/// Lowercase suffix appended to the machine name to avoid collisions.
pub fn generate_name_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..NAME_SUFFIX_LEN).map(|_| pick(&mut rng, LOWER)).collect()
}

pub fn server_name(machine_name: &str, suffix: &str) -> String {
    format!("{machine_name}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passwords_meet_policy() {
        for _ in 0..200 {
            let password = generate_password();
            assert_eq!(password.len(), PASSWORD_LEN);
            assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
            assert!(password.chars().any(|c| c.is_ascii_uppercase()));
            assert!(password.chars().filter(|c| c.is_ascii_digit()).count() >= 1);
        }
    }

    #[test]
    fn name_suffix_shape() {
        let suffix = generate_name_suffix();
        assert_eq!(suffix.len(), NAME_SUFFIX_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase()));
        assert_eq!(server_name("web", &suffix), format!("web-{suffix}"));
    }
}
