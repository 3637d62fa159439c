//! Activation code generation and one-way hashing.
//!
//! Codes are hashed with Argon2id and a per-record random salt. Hashing and
//! verification are CPU-bound and run on the blocking pool so they never stall the
//! async executor.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

/// Unambiguous alphabet: no `0`, `O`, `1` or `I`.
pub const CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const CODE_LENGTH: usize = 12;
const GROUP_SIZE: usize = 4;

/// Argon2 cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct HashParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for HashParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl HashParams {
    /// Minimum cost accepted by argon2. Only for tests.
    pub fn insecure_fast() -> Self {
        Self {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }
}

/// Stored PHC hash string. Debug output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct CodeHash(String);

impl CodeHash {
    pub fn new(hash: String) -> Self {
        Self(hash)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Debug for CodeHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CodeHash(<redacted>)")
    }
}

/// Generate a fresh plaintext code in display form (`XXXX-XXXX-XXXX`).
pub fn generate_code() -> SecretString {
    let mut rng = rand::rngs::OsRng;
    let raw: String = (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect();
    SecretString::new(format_code(&raw))
}

/// Group a normalized code into dash-separated blocks of four.
pub fn format_code(normalized: &str) -> String {
    normalized
        .as_bytes()
        .chunks(GROUP_SIZE)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join("-")
}

/// Strip dashes and whitespace and upper-case. Returns `None` when the result is not
/// a well-formed code.
pub fn normalize_code(input: &str) -> Option<String> {
    let normalized: String = input
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    let well_formed = normalized.len() == CODE_LENGTH
        && normalized.bytes().all(|b| CODE_ALPHABET.contains(&b));

    well_formed.then_some(normalized)
}

#[derive(Clone)]
pub struct CodeHasher {
    argon2: Argon2<'static>,
    /// Verified against when there is nothing real to compare, so unknown
    /// identifiers cost the same as known ones.
    decoy: CodeHash,
}

impl CodeHasher {
    pub fn new(params: HashParams) -> anyhow::Result<Self> {
        let params = Params::new(params.memory_kib, params.iterations, params.parallelism, None)
            .map_err(|e| anyhow::anyhow!("Invalid argon2 parameters: {}", e))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let decoy_input = normalize_code(generate_code().expose_secret())
            .ok_or_else(|| anyhow::anyhow!("Generated code failed normalization"))?;
        let decoy = hash_with(&argon2, &decoy_input)?;

        Ok(Self { argon2, decoy })
    }

    /// Hash a code. Input is normalized first so display and typed forms hash alike.
    pub async fn hash(&self, code: &SecretString) -> anyhow::Result<CodeHash> {
        let normalized = normalize_code(code.expose_secret())
            .ok_or_else(|| anyhow::anyhow!("Refusing to hash a malformed code"))?;
        let argon2 = self.argon2.clone();

        tokio::task::spawn_blocking(move || hash_with(&argon2, &normalized))
            .await
            .map_err(|e| anyhow::anyhow!("Hash task failed: {}", e))?
    }

    /// Verify a normalized code against every candidate without stopping at the first
    /// match. Returns the index of the matching candidate, if any.
    pub async fn verify_any(
        &self,
        normalized: &str,
        candidates: Vec<CodeHash>,
    ) -> anyhow::Result<Option<usize>> {
        let argon2 = self.argon2.clone();
        let input = normalized.to_string();
        let decoy = self.decoy.clone();

        tokio::task::spawn_blocking(move || {
            if candidates.is_empty() {
                let _ = verify_with(&argon2, &input, &decoy);
                return None;
            }

            let mut matched = None;
            for (idx, candidate) in candidates.iter().enumerate() {
                if verify_with(&argon2, &input, candidate) && matched.is_none() {
                    matched = Some(idx);
                }
            }
            matched
        })
        .await
        .map_err(|e| anyhow::anyhow!("Verify task failed: {}", e))
    }

    /// Spend one verification's worth of work against the decoy hash.
    pub async fn burn(&self, normalized: &str) -> anyhow::Result<()> {
        self.verify_any(normalized, Vec::new()).await.map(|_| ())
    }
}

fn hash_with(argon2: &Argon2<'_>, normalized: &str) -> anyhow::Result<CodeHash> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = argon2
        .hash_password(normalized.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash code: {}", e))?
        .to_string();
    Ok(CodeHash::new(hash))
}

/// Constant-time comparison against one stored hash. Unparseable hashes never match.
fn verify_with(argon2: &Argon2<'_>, normalized: &str, hash: &CodeHash) -> bool {
    match PasswordHash::new(hash.as_str()) {
        Ok(parsed) => argon2
            .verify_password(normalized.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "Stored code hash is not a valid PHC string");
            false
        }
    }
}
