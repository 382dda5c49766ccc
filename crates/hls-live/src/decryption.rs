// AES-128-CBC segment decryption.

use aes::Aes128;
use bytes::Bytes;
use cbc::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use tracing::trace;

use crate::collaborators::{Cipher, CipherFactory};
use crate::error::DecryptionError;
use crate::events::{CipherEvent, EventBus};
use crate::parser::EncryptionMethod;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Decrypt a whole segment with PKCS#7 padding removed.
pub fn decrypt_segment(data: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Result<Bytes, DecryptionError> {
    let mut buffer = data.to_vec();
    let cipher = Aes128CbcDec::new_from_slices(key, iv).map_err(|e| {
        DecryptionError::Failed(format!("Failed to initialize AES decryptor: {e}"))
    })?;
    let decrypted_len = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|e| DecryptionError::Failed(format!("Decryption failed: {e}")))?
        .len();
    buffer.truncate(decrypted_len);
    Ok(Bytes::from(buffer))
}

/// Cipher bound to one AES-128 key. Optionally runs on the blocking pool.
pub struct Aes128Cipher {
    key: [u8; 16],
    bus: EventBus,
    offload: bool,
}

impl Aes128Cipher {
    fn publish(bus: &EventBus, sequence: u64, result: Result<Bytes, DecryptionError>) {
        match result {
            Ok(data) => bus.publish(CipherEvent::Decrypted { sequence, data }),
            Err(error) => bus.publish(CipherEvent::DecryptError { sequence, error }),
        }
    }
}

impl Cipher for Aes128Cipher {
    fn decrypt(&mut self, sequence: u64, iv: [u8; 16], data: Bytes) {
        trace!(sequence, bytes = data.len(), offload = self.offload, "Decrypting segment");
        let key = self.key;

        if self.offload
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            let bus = self.bus.clone();
            handle.spawn(async move {
                let result = tokio::task::spawn_blocking(move || decrypt_segment(&data, &key, &iv))
                    .await
                    .unwrap_or_else(|e| {
                        Err(DecryptionError::Failed(format!("Decryption offload task failed: {e}")))
                    });
                Self::publish(&bus, sequence, result);
            });
            return;
        }

        Self::publish(&self.bus, sequence, decrypt_segment(&data, &key, &iv));
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Aes128CipherFactory {
    offload: bool,
}

impl Aes128CipherFactory {
    /// With `offload`, decryption runs on the blocking thread pool when a
    /// runtime is available.
    pub fn new(offload: bool) -> Self {
        Self { offload }
    }
}

impl CipherFactory for Aes128CipherFactory {
    fn create(
        &self,
        method: &EncryptionMethod,
        key: &Bytes,
        bus: &EventBus,
    ) -> Result<Box<dyn Cipher>, DecryptionError> {
        if *method != EncryptionMethod::Aes128 {
            return Err(DecryptionError::UnsupportedMethod(format!("{method:?}")));
        }
        let key: [u8; 16] = key
            .as_ref()
            .try_into()
            .map_err(|_| DecryptionError::InvalidKeyLength(key.len()))?;
        Ok(Box::new(Aes128Cipher {
            key,
            bus: bus.clone(),
            offload: self.offload,
        }))
    }
}
