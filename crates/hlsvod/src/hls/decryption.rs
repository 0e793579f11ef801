// HLS Decryption: AES-128-CBC with permissive PKCS#7 removal.

use crate::error::TransferError;
use aes::Aes128;
use bytes::Bytes;
use cipher::{BlockDecryptMut, KeyIvInit, block_padding::NoPadding};
use tracing::warn;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

const BLOCK_SIZE: usize = 16;

/// Decrypts segments, optionally on the blocking thread pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decryptor {
    offload: bool,
}

impl Decryptor {
    pub fn new(offload: bool) -> Self {
        Self { offload }
    }

    pub async fn decrypt(
        &self,
        data: Bytes,
        key: &[u8],
        iv: &[u8; 16],
    ) -> Result<Bytes, TransferError> {
        if self.offload {
            let key = key.to_vec();
            let iv = *iv;
            tokio::task::spawn_blocking(move || decrypt_segment(&data, &key, &iv))
                .await
                .map_err(|e| TransferError::decrypt(format!("decryption task failed: {e}")))?
        } else {
            decrypt_segment(&data, key, iv)
        }
    }
}

/// AES-128-CBC decrypt, then strip PKCS#7 padding when it is well formed.
///
/// A wrong key length or a ciphertext that is not a whole number of blocks is
/// an error. A malformed padding trailer is not: the plaintext is returned as is.
pub fn decrypt_segment(data: &[u8], key: &[u8], iv: &[u8; 16]) -> Result<Bytes, TransferError> {
    if data.is_empty() {
        return Err(TransferError::decrypt("ciphertext is empty"));
    }
    if data.len() % BLOCK_SIZE != 0 {
        return Err(TransferError::decrypt(format!(
            "ciphertext length {} is not a multiple of {BLOCK_SIZE}",
            data.len()
        )));
    }

    let cipher = Aes128CbcDec::new_from_slices(key, iv).map_err(|e| {
        TransferError::decrypt(format!(
            "failed to initialize AES decryptor (key is {} bytes): {e}",
            key.len()
        ))
    })?;

    let mut buffer = data.to_vec();
    let decrypted_len = cipher
        .decrypt_padded_mut::<NoPadding>(&mut buffer)
        .map_err(|e| TransferError::decrypt(format!("decryption failed: {e}")))?
        .len();
    buffer.truncate(decrypted_len);

    match pkcs7_padding_len(&buffer) {
        Some(padding) => buffer.truncate(buffer.len() - padding),
        None => {
            warn!(
                len = buffer.len(),
                last_byte = buffer.last().copied().unwrap_or_default(),
                "PKCS#7 padding anomaly, keeping decrypted segment unpadded"
            );
        }
    }

    Ok(Bytes::from(buffer))
}

/// Length of a valid PKCS#7 trailer, or `None` if the trailer is malformed.
fn pkcs7_padding_len(data: &[u8]) -> Option<usize> {
    let padding = *data.last()? as usize;
    if padding == 0 || padding > BLOCK_SIZE || padding > data.len() {
        return None;
    }
    data[data.len() - padding..]
        .iter()
        .all(|&b| b as usize == padding)
        .then_some(padding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cipher::BlockEncryptMut;
    use cipher::block_padding::Pkcs7;

    type Aes128CbcEnc = cbc::Encryptor<Aes128>;

    const KEY: [u8; 16] = [0x42; 16];
    const IV: [u8; 16] = [0x24; 16];

    fn encrypt_pkcs7(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
        let cipher = Aes128CbcEnc::new_from_slices(key, iv).unwrap();
        let padded_len = ((plaintext.len() / 16) + 1) * 16;
        let mut buffer = vec![0u8; padded_len];
        buffer[..plaintext.len()].copy_from_slice(plaintext);
        cipher
            .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
            .unwrap()
            .to_vec()
    }

    fn encrypt_raw(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
        let cipher = Aes128CbcEnc::new_from_slices(key, iv).unwrap();
        let mut buffer = plaintext.to_vec();
        let len = buffer.len();
        cipher
            .encrypt_padded_mut::<NoPadding>(&mut buffer, len)
            .unwrap()
            .to_vec()
    }

    #[test]
    fn round_trip_restores_plaintext() {
        let plaintext: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        let encrypted = encrypt_pkcs7(&plaintext, &KEY, &IV);
        let decrypted = decrypt_segment(&encrypted, &KEY, &IV).unwrap();
        assert_eq!(decrypted.as_ref(), plaintext.as_slice());
    }

    #[test]
    fn block_aligned_plaintext_drops_full_padding_block() {
        let plaintext = [0xABu8; 32];
        let encrypted = encrypt_pkcs7(&plaintext, &KEY, &IV);
        assert_eq!(encrypted.len(), 48);
        let decrypted = decrypt_segment(&encrypted, &KEY, &IV).unwrap();
        assert_eq!(decrypted.as_ref(), &plaintext);
    }

    #[test]
    fn malformed_padding_returns_data_unchanged() {
        // Last byte 0x05 but the preceding bytes do not repeat it.
        let mut plaintext = [0x11u8; 32];
        plaintext[31] = 0x05;
        let encrypted = encrypt_raw(&plaintext, &KEY, &IV);
        let decrypted = decrypt_segment(&encrypted, &KEY, &IV).unwrap();
        assert_eq!(decrypted.as_ref(), &plaintext);
    }

    #[test]
    fn out_of_range_padding_byte_returns_data_unchanged() {
        let mut plaintext = [0x00u8; 16];
        plaintext[15] = 0x47; // 71 > 16
        let encrypted = encrypt_raw(&plaintext, &KEY, &IV);
        let decrypted = decrypt_segment(&encrypted, &KEY, &IV).unwrap();
        assert_eq!(decrypted.as_ref(), &plaintext);

        plaintext[15] = 0x00;
        let encrypted = encrypt_raw(&plaintext, &KEY, &IV);
        let decrypted = decrypt_segment(&encrypted, &KEY, &IV).unwrap();
        assert_eq!(decrypted.as_ref(), &plaintext);
    }

    #[test]
    fn misaligned_ciphertext_is_a_decrypt_error() {
        let err = decrypt_segment(&[0u8; 17], &KEY, &IV).unwrap_err();
        assert!(matches!(err, TransferError::Decrypt { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn wrong_key_length_is_a_decrypt_error() {
        let err = decrypt_segment(&[0u8; 32], &[1u8; 8], &IV).unwrap_err();
        assert!(matches!(err, TransferError::Decrypt { .. }));
    }

    #[test]
    fn padding_length_validation() {
        assert_eq!(pkcs7_padding_len(&[9, 9, 3, 3, 3]), Some(3));
        assert_eq!(pkcs7_padding_len(&[9, 9, 2, 3, 3]), None);
        assert_eq!(pkcs7_padding_len(&[0]), None);
        assert_eq!(pkcs7_padding_len(&[4, 4]), None);
        assert_eq!(pkcs7_padding_len(&[]), None);
    }

    #[tokio::test]
    async fn offloaded_decryption_matches_inline() {
        let plaintext = b"offload me to the blocking pool please".to_vec();
        let encrypted = Bytes::from(encrypt_pkcs7(&plaintext, &KEY, &IV));
        let inline = Decryptor::new(false)
            .decrypt(encrypted.clone(), &KEY, &IV)
            .await
            .unwrap();
        let offloaded = Decryptor::new(true)
            .decrypt(encrypted, &KEY, &IV)
            .await
            .unwrap();
        assert_eq!(inline, offloaded);
        assert_eq!(inline.as_ref(), plaintext.as_slice());
    }
}
