use sha1::{Digest, Sha1};
use sha2::Sha256;

/// `mysql_native_password` scramble:
/// `SHA1(password) XOR SHA1(nonce + SHA1(SHA1(password)))`.
pub fn scramble_native(nonce: &[u8], password: &[u8]) -> [u8; 20] {
  let hashed = sha1(&[password]);
  let double_hashed = sha1(&[&hashed]);
  let mut scrambled = sha1(&[nonce, &double_hashed]);
  xor(&mut scrambled, &hashed);
  scrambled
}

/// `caching_sha2_password` fast-path scramble:
/// `SHA256(password) XOR SHA256(SHA256(SHA256(password)) + nonce)`.
pub fn scramble_sha256(nonce: &[u8], password: &[u8]) -> [u8; 32] {
  let hashed = sha256(&[password]);
  let double_hashed = sha256(&[&hashed]);
  let mut scrambled = sha256(&[&double_hashed, nonce]);
  xor(&mut scrambled, &hashed);
  scrambled
}

fn sha1(inputs: &[&[u8]]) -> [u8; 20] {
  let mut hasher = Sha1::new();
  for input in inputs {
    hasher.update(input);
  }
  hasher.finalize().into()
}

fn sha256(inputs: &[&[u8]]) -> [u8; 32] {
  let mut hasher = Sha256::new();
  for input in inputs {
    hasher.update(input);
  }
  hasher.finalize().into()
}

fn xor(lhs: &mut [u8], rhs: &[u8]) {
  for (l, r) in lhs.iter_mut().zip(rhs.iter()) {
    *l ^= r;
  }
}
