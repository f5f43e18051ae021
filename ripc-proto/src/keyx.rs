//! Diffie-Hellman-style key exchange used by the version 14 handshake.
//!
//! Both sides agree on a prime `p` and generator `g`; each picks a
//! private exponent, exchanges `g^private mod p`, and derives the shared
//! key as `peer_public^private mod p`.

/// Default 64-bit prime used when the server does not configure its own
/// parameters (2^64 - 59, the largest prime representable in a u64).
pub const DEFAULT_P: u64 = 0xFFFF_FFFF_FFFF_FFC5;

/// Default generator paired with [`DEFAULT_P`].
pub const DEFAULT_G: u64 = 5;

/// Square-and-multiply modular exponentiation with 128-bit intermediates.
pub fn mod_exp(base: u64, exponent: u64, modulus: u64) -> u64 {
    if modulus <= 1 {
        return 0;
    }
    let m = modulus as u128;
    let mut result: u128 = 1;
    let mut base = base as u128 % m;
    let mut exp = exponent;
    while exp > 0 {
        if exp & 1 == 1 {
            result = result * base % m;
        }
        base = base * base % m;
        exp >>= 1;
    }
    result as u64
}

/// One side's key-exchange state.
#[derive(Debug, Clone, Copy)]
pub struct KeyExchange {
    pub p: u64,
    pub g: u64,
    private: u64,
}

impl KeyExchange {
    pub fn new(p: u64, g: u64, private: u64) -> KeyExchange {
        KeyExchange { p, g, private }
    }

    /// The value sent to the peer: `g^private mod p`.
    pub fn public_key(&self) -> u64 {
        mod_exp(self.g, self.private, self.p)
    }

    /// The shared key derived from the peer's public value.
    pub fn shared_key(&self, peer_public: u64) -> u64 {
        mod_exp(peer_public, self.private, self.p)
    }
}
