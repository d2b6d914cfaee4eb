//! Manage tokens for remote client IPs.

use crc::{Crc, CRC_32_ISCSI};
use std::{
    fmt::{self, Debug, Formatter},
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use tracing::trace;

const SECRET_SIZE: usize = 20;
const TOKEN_SIZE: usize = 4;
const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Tokens stay valid between one and two rotations.
pub const TOKEN_ROTATE_INTERVAL: Duration = Duration::from_secs(60 * 5);

/// Issues and checks the write tokens handed out in `get_peers` responses.
pub trait TokenService: Debug + Send + Sync {
    fn gen_token(&mut self, address: SocketAddr) -> Vec<u8>;

    fn check_token(&mut self, address: SocketAddr, token: &[u8]) -> bool;
}

/// Tokens generator.
///
/// A token is the CRC32-C of the requester's ip and a secret rotated every
/// [TOKEN_ROTATE_INTERVAL], the previous secret is still accepted.
///
/// Read [BEP_0005](https://www.bittorrent.org/beps/bep_0005.html) for more information.
#[derive(Clone)]
pub struct Tokens {
    prev_secret: [u8; SECRET_SIZE],
    curr_secret: [u8; SECRET_SIZE],
    last_updated: Instant,
}

impl Debug for Tokens {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Tokens (_)")
    }
}

impl Tokens {
    /// Create a Tokens generator.
    pub fn new() -> Self {
        Tokens {
            prev_secret: rand::random(),
            curr_secret: rand::random(),
            last_updated: Instant::now(),
        }
    }

    // === Public Methods ===

    /// Returns `true` if the current secret needs to be updated after an interval.
    pub fn should_update(&self) -> bool {
        self.last_updated.elapsed() > TOKEN_ROTATE_INTERVAL
    }

    /// Validate that the token was generated with the current or previous secret.
    pub fn validate(&self, address: SocketAddr, token: &[u8]) -> bool {
        let prev = internal_generate_token(address.ip(), &self.prev_secret);
        let curr = internal_generate_token(address.ip(), &self.curr_secret);

        token == curr || token == prev
    }

    /// Rotate the tokens secret.
    pub fn rotate(&mut self) {
        trace!(context = "tokens", "Rotating secrets");

        self.prev_secret = self.curr_secret;
        self.curr_secret = rand::random();

        self.last_updated = Instant::now();
    }

    /// Generates a new token for a remote peer.
    pub fn generate_token(&self, address: SocketAddr) -> [u8; TOKEN_SIZE] {
        internal_generate_token(address.ip(), &self.curr_secret)
    }
}

impl TokenService for Tokens {
    fn gen_token(&mut self, address: SocketAddr) -> Vec<u8> {
        if self.should_update() {
            self.rotate();
        }

        self.generate_token(address).to_vec()
    }

    fn check_token(&mut self, address: SocketAddr, token: &[u8]) -> bool {
        if self.should_update() {
            self.rotate();
        }

        self.validate(address, token)
    }
}

impl Default for Tokens {
    fn default() -> Self {
        Self::new()
    }
}

fn internal_generate_token(ip: IpAddr, secret: &[u8; SECRET_SIZE]) -> [u8; TOKEN_SIZE] {
    let mut digest = CASTAGNOLI.digest();

    match ip {
        IpAddr::V4(ip) => digest.update(&ip.octets()),
        IpAddr::V6(ip) => digest.update(&ip.octets()),
    }
    digest.update(secret);

    digest.finalize().to_be_bytes()
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn valid_tokens() {
        let mut tokens = Tokens::new();

        let address = SocketAddr::from(([127, 0, 0, 1], 6881));
        let token = tokens.gen_token(address);

        assert!(tokens.check_token(address, &token));

        // Only the ip matters.
        let other_port = SocketAddr::from(([127, 0, 0, 1], 6882));
        assert!(tokens.check_token(other_port, &token));

        let other_ip = SocketAddr::from(([127, 0, 0, 2], 6881));
        assert!(!tokens.check_token(other_ip, &token));
    }

    #[test]
    fn previous_secret_still_accepted() {
        let mut tokens = Tokens::new();
        let address = SocketAddr::from(([10, 0, 0, 1], 6881));
        let token = tokens.generate_token(address);

        tokens.rotate();
        assert!(tokens.validate(address, &token));

        tokens.rotate();
        assert!(!tokens.validate(address, &token));
    }
}
