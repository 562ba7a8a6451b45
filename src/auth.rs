// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Classic VNC authentication (RFB security type 2).
//!
//! The server sends a 16-byte random challenge; the client encrypts it
//! with DES using a key derived from the password and sends back the
//! 16-byte result. VNC's key schedule is non-standard: the password is
//! right-padded with NUL to 8 bytes (truncated if longer), and each key
//! byte has its bits reversed before being used as a DES key. This
//! reversal is a historical quirk of the original X11 VNC server and is
//! required for wire compatibility with every deployed VNC client.

use des::Des;
use des::cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray};
use rand::RngCore;

/// Handles VNC classic authentication challenge/response for one session.
pub struct VncAuth {
    key: [u8; 8],
}

impl VncAuth {
    /// Builds the DES key from an optional password. A `None` password
    /// still produces a usable (all-zero) key, though callers should only
    /// reach VncAuth when a password was actually configured.
    #[must_use]
    pub fn new(password: Option<String>) -> Self {
        let mut padded = [0u8; 8];
        if let Some(pw) = password {
            let bytes = pw.as_bytes();
            let n = bytes.len().min(8);
            padded[..n].copy_from_slice(&bytes[..n]);
        }

        let mut key = [0u8; 8];
        for (i, byte) in padded.iter().enumerate() {
            key[i] = reverse_bits(*byte);
        }

        Self { key }
    }

    /// Generates a fresh 16-byte random challenge.
    #[must_use]
    pub fn generate_challenge(&self) -> [u8; 16] {
        let mut challenge = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut challenge);
        challenge
    }

    /// Verifies a client's 16-byte response against the challenge this
    /// session issued, by DES-encrypting the challenge (two 8-byte ECB
    /// blocks) with the password-derived key and comparing.
    #[must_use]
    pub fn verify_response(&self, response: &[u8], challenge: &[u8; 16]) -> bool {
        if response.len() != 16 {
            return false;
        }

        let expected = self.encrypt_challenge(challenge);
        expected == response
    }

    fn encrypt_challenge(&self, challenge: &[u8; 16]) -> [u8; 16] {
        let cipher = Des::new(GenericArray::from_slice(&self.key));

        let mut out = [0u8; 16];
        for half in 0..2 {
            let mut block = GenericArray::clone_from_slice(&challenge[half * 8..half * 8 + 8]);
            cipher.encrypt_block(&mut block);
            out[half * 8..half * 8 + 8].copy_from_slice(&block);
        }
        out
    }
}

/// Reverses the bit order within a byte (classic VNC DES key quirk).
fn reverse_bits(mut b: u8) -> u8 {
    let mut r = 0u8;
    for _ in 0..8 {
        r = (r << 1) | (b & 1);
        b >>= 1;
    }
    r
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_bits_round_trips() {
        assert_eq!(reverse_bits(reverse_bits(0b1011_0001)), 0b1011_0001);
        assert_eq!(reverse_bits(0b0000_0001), 0b1000_0000);
        assert_eq!(reverse_bits(0b1111_0000), 0b0000_1111);
    }

    #[test]
    fn correct_password_verifies() {
        let auth = VncAuth::new(Some("secret".to_string()));
        let challenge = auth.generate_challenge();
        let response = auth.encrypt_challenge(&challenge);
        assert!(auth.verify_response(&response, &challenge));
    }

    #[test]
    fn wrong_password_fails() {
        let server_auth = VncAuth::new(Some("secret".to_string()));
        let client_auth = VncAuth::new(Some("wrong".to_string()));
        let challenge = server_auth.generate_challenge();
        let bogus_response = client_auth.encrypt_challenge(&challenge);
        assert!(!server_auth.verify_response(&bogus_response, &challenge));
    }

    #[test]
    fn password_longer_than_8_bytes_is_truncated() {
        let short = VncAuth::new(Some("12345678".to_string()));
        let long = VncAuth::new(Some("12345678-extra-ignored".to_string()));
        assert_eq!(short.key, long.key);
    }

    #[test]
    fn malformed_response_length_fails() {
        let auth = VncAuth::new(Some("secret".to_string()));
        let challenge = auth.generate_challenge();
        assert!(!auth.verify_response(&[0u8; 4], &challenge));
    }
}
