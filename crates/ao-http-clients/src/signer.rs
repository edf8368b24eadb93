//! The data-item signing/bundling library is an external collaborator,
//! out of scope for this workspace (spec.md §1). `ExternalSigner` is the
//! wiring-time placeholder for it: it knows the wallet's public owner
//! address (read once at startup) but defers the actual signature to
//! whatever bundling library a deployment links in, rather than
//! approximating one here.

use ao_types::CuError;

pub struct ExternalSigner {
    owner_address: String,
}

impl ExternalSigner {
    pub fn new(owner_address: impl Into<String>) -> Self {
        ExternalSigner {
            owner_address: owner_address.into(),
        }
    }
}

impl checkpoint_store::Signer for ExternalSigner {
    fn owner_address(&self) -> &str {
        &self.owner_address
    }

    fn sign(&self, _item: checkpoint_store::CheckpointDataItem) -> Result<checkpoint_store::SignedDataItem, CuError> {
        Err(CuError::fatal(anyhow::anyhow!(
            "no bundling/signing library configured; link one in behind checkpoint_store::Signer"
        )))
    }
}

impl mu_cranker::Signer for ExternalSigner {
    fn owner_address(&self) -> &str {
        &self.owner_address
    }

    fn sign(&self, _item: mu_cranker::DataItem) -> Result<mu_cranker::SignedDataItem, CuError> {
        Err(CuError::fatal(anyhow::anyhow!(
            "no bundling/signing library configured; link one in behind mu_cranker::Signer"
        )))
    }
}
