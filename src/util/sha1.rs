use sha1::{Digest, Sha1};

pub fn sha1_digest(data: impl AsRef<[u8]>) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data.as_ref());
    let result = hasher.finalize();
    let mut buf = [0u8; 20];
    buf.copy_from_slice(&result);
    buf
}

pub fn sha1_hex(data: impl AsRef<[u8]>) -> String {
    let digest = sha1_digest(data);
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}
