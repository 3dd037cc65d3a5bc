use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use alloy::primitives::{Address, Bytes, PrimitiveSignature, B256};
use alloy::signers::k256::elliptic_curve::sec1::ToEncodedPoint;
use alloy::signers::local::PrivateKeySigner;
use eyre::Result;
use tracing::debug;

use mirage_common::errors::SimulationError;

/// Lets the simulator accept transactions "from" addresses it holds no key
/// for. A registered public key gets a synthetic key pair; transactions are
/// signed with the synthetic key and [`SignatureMatcher::ecrecover`] lies to
/// the execution layer by translating the recovered synthetic signer back to
/// the impersonated public key.
#[derive(Clone, Default)]
pub struct SignatureMatcher {
    inner: Arc<RwLock<Registry>>,
}

#[derive(Default)]
struct Registry {
    /// impersonated address -> uncompressed public key (64 bytes, no prefix)
    public_keys: HashMap<Address, Bytes>,
    /// impersonated address -> synthetic private key
    private_keys: HashMap<Address, B256>,
    /// synthetic signer address -> impersonated address
    synthetic_senders: HashMap<Address, Address>,
}

impl SignatureMatcher {
    /// Register a public key for impersonation and return its address.
    /// Accepts the 65-byte SEC1 uncompressed encoding or the bare 64 bytes.
    pub fn register_public_key(&self, public_key: &[u8]) -> Result<Address> {
        let key = match public_key.len() {
            65 if public_key[0] == 0x04 => Bytes::copy_from_slice(&public_key[1..]),
            64 => Bytes::copy_from_slice(public_key),
            len => {
                return Err(SimulationError::InvalidArgument(format!(
                    "public key must be 64 or 65 bytes, got {len}"
                ))
                .into())
            }
        };

        let address = Address::from_raw_public_key(&key);
        self.inner
            .write()
            .unwrap()
            .public_keys
            .insert(address, key);

        debug!(target: "mirage::signer", %address, "registered impersonated public key");
        Ok(address)
    }

    pub fn is_registered(&self, address: Address) -> bool {
        self.inner.read().unwrap().public_keys.contains_key(&address)
    }

    /// The synthetic private key for an impersonated address, generating a
    /// fresh pair on first use. Fails if the public key was never registered.
    pub fn simulation_private_key(&self, address: Address) -> Result<B256> {
        let mut registry = self.inner.write().unwrap();

        if !registry.public_keys.contains_key(&address) {
            return Err(SimulationError::Precondition(format!(
                "no public key registered for {address}"
            ))
            .into());
        }

        if let Some(key) = registry.private_keys.get(&address) {
            return Ok(*key);
        }

        let signer = PrivateKeySigner::random();
        let key = signer.to_bytes();
        registry.private_keys.insert(address, key);
        registry.synthetic_senders.insert(signer.address(), address);

        debug!(
            target: "mirage::signer",
            impersonated = %address,
            synthetic = %signer.address(),
            "issued synthetic key pair"
        );

        Ok(key)
    }

    /// Recover the public key behind a signature.
    ///
    /// Performs real secp256k1 recovery; if the recovered address belongs to
    /// a synthetic key pair, the impersonated public key is returned in its
    /// place. Signatures from anyone else pass through untouched.
    pub fn ecrecover(&self, sighash: B256, signature: &PrimitiveSignature) -> Result<Bytes> {
        let verifying_key = signature.recover_from_prehash(&sighash)?;
        let point = verifying_key.to_encoded_point(false);
        let recovered = Bytes::copy_from_slice(&point.as_bytes()[1..]);
        let recovered_address = Address::from_raw_public_key(&recovered);

        let registry = self.inner.read().unwrap();
        match registry.synthetic_senders.get(&recovered_address) {
            None => Ok(recovered),
            Some(impersonated) => registry
                .public_keys
                .get(impersonated)
                .cloned()
                .ok_or_else(|| {
                    SimulationError::Internal(format!(
                        "synthetic sender {recovered_address} maps to {impersonated} with no registered public key"
                    ))
                    .into()
                }),
        }
    }

    /// The sender address the execution layer should observe for a signature.
    pub fn recover_caller(&self, sighash: B256, signature: &PrimitiveSignature) -> Result<Address> {
        let public_key = self.ecrecover(sighash, signature)?;
        Ok(Address::from_raw_public_key(&public_key))
    }
}
