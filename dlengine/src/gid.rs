use rand::{distr::Alphanumeric, Rng};

/// Length of every generated download identifier.
pub const GID_LENGTH: usize = 16;

/// Generate an opaque identifier for one submitted transfer.
pub fn generate() -> String {
    let mut rng = rand::rng();
    (0..GID_LENGTH)
        .map(|_| char::from(rng.sample(Alphanumeric)))
        .collect()
}
