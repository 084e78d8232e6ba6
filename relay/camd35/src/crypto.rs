use core::fmt;

use aes::{
    Aes128, Block,
    cipher::{BlockDecrypt, BlockEncrypt, KeyInit},
};
use md5::{Digest, Md5};

use relay_core::{RelayError, RelayResult};

/**
    AES-128-ECB cipher applied to every frame after the leading CRC.
    The key is the MD5 digest of the account password.
*/
#[derive(Clone)]
pub struct FrameCipher {
    cipher: Aes128,
}

impl FrameCipher {
    pub const BLOCK_LEN: usize = 16;

    pub fn new(password: &str) -> Self {
        let key: [u8; 16] = Md5::digest(password.as_bytes()).into();
        Self {
            cipher: Aes128::new(&key.into()),
        }
    }

    /**
        Encrypt every whole block of `data` in place. A trailing partial
        block is left untouched.
    */
    pub fn encrypt(&self, data: &mut [u8]) {
        for chunk in data.chunks_exact_mut(Self::BLOCK_LEN) {
            self.cipher.encrypt_block(Block::from_mut_slice(chunk));
        }
    }

    pub fn decrypt(&self, data: &mut [u8]) {
        for chunk in data.chunks_exact_mut(Self::BLOCK_LEN) {
            self.cipher.decrypt_block(Block::from_mut_slice(chunk));
        }
    }
}

impl fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FrameCipher(..)")
    }
}

/**
    CRC32 of the MD5 digest of `username`, big-endian. Prefixed to every
    frame so the receiver can pick the account without decrypting.
*/
pub fn user_crc(username: &str) -> [u8; 4] {
    let digest = Md5::digest(username.as_bytes());
    crc32fast::hash(&digest).to_be_bytes()
}

/**
    One account: the user CRC that identifies it and the frame cipher keyed
    by its password.
*/
#[derive(Clone)]
pub struct Credential {
    username: String,
    ucrc: [u8; 4],
    cipher: FrameCipher,
}

impl Credential {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            ucrc: user_crc(username),
            cipher: FrameCipher::new(password),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn ucrc(&self) -> [u8; 4] {
        self.ucrc
    }

    pub fn cipher(&self) -> &FrameCipher {
        &self.cipher
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("ucrc", &hex::encode(self.ucrc))
            .finish_non_exhaustive()
    }
}

/**
    Resolves the leading CRC of an inbound frame to the cipher it was sealed with.
*/
pub trait Keyring {
    /**
        Fails with `UnknownUser` when no account matches `ucrc`.
    */
    fn cipher_for(&mut self, ucrc: [u8; 4]) -> RelayResult<&FrameCipher>;
}

impl Keyring for Credential {
    fn cipher_for(&mut self, ucrc: [u8; 4]) -> RelayResult<&FrameCipher> {
        if ucrc == self.ucrc {
            Ok(&self.cipher)
        } else {
            Err(RelayError::UnknownUser)
        }
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    #[test]
    fn user_crc_reference() {
        assert_eq!(user_crc("user"), hex!("dd030b17"));
    }

    #[test]
    fn aes_reference_block() {
        let cipher = FrameCipher::new("pass");
        let mut block = [0u8; 16];
        cipher.encrypt(&mut block);
        assert_eq!(block, hex!("f94a8d1a9656eb3dbbaad98e1914a922"));
        cipher.decrypt(&mut block);
        assert_eq!(block, [0u8; 16]);
    }

    #[test]
    fn partial_block_is_untouched() {
        let cipher = FrameCipher::new("pass");
        let mut data = [0xAAu8; 20];
        cipher.encrypt(&mut data);
        assert_eq!(&data[16..], &[0xAA; 4]);
        assert_ne!(&data[..16], &[0xAA; 16]);
    }

    #[test]
    fn keyring_matches_only_own_crc() {
        let mut credential = Credential::new("user", "pass");
        assert!(credential.cipher_for(hex!("dd030b17")).is_ok());
        assert_eq!(
            credential.cipher_for([0; 4]).err(),
            Some(RelayError::UnknownUser)
        );
    }
}
