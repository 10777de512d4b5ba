//! Source IP hashing (§6 persisted files: `.ip-salt`, mode 0600). Audit
//! events carry a hash of the caller's address rather than the address
//! itself; the salt is local to a deployment so the hash can't be
//! dictionary-attacked against a known IP list from another install.

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::net::IpAddr;
use std::path::Path;

const SALT_LEN: usize = 32;

pub struct IpSalt(Box<[u8]>);

impl IpSalt {
    pub fn load_or_create(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(".ip-salt");

        if path.exists() {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            if bytes.len() != SALT_LEN {
                anyhow::bail!("{} does not contain a {SALT_LEN}-byte salt", path.display());
            }
            return Ok(Self(bytes.into_boxed_slice()));
        }

        let mut bytes = vec![0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        std::fs::write(&path, &bytes).with_context(|| format!("writing {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(Self(bytes.into_boxed_slice()))
    }

    /// HMAC-SHA256(salt, ip), hex-encoded. Never reversible back to the IP
    /// without the salt, per the same property the session HMAC secret
    /// relies on in `session.rs`.
    pub fn hash(&self, ip: IpAddr) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.0).expect("hmac accepts any key length");
        mac.update(ip.to_string().as_bytes());
        let digest = mac.finalize().into_bytes();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_salt_persists() {
        let dir = tempfile::tempdir().unwrap();
        let a = IpSalt::load_or_create(dir.path()).unwrap();
        let b = IpSalt::load_or_create(dir.path()).unwrap();
        let ip: IpAddr = "198.51.100.7".parse().unwrap();
        assert_eq!(a.hash(ip), b.hash(ip));
    }

    #[test]
    fn distinct_ips_hash_differently() {
        let dir = tempfile::tempdir().unwrap();
        let salt = IpSalt::load_or_create(dir.path()).unwrap();
        let a: IpAddr = "198.51.100.7".parse().unwrap();
        let b: IpAddr = "203.0.113.9".parse().unwrap();
        assert_ne!(salt.hash(a), salt.hash(b));
    }
}
