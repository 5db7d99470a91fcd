use ethers_core::abi::{encode, Token};
use ethers_core::types::{Address, Bytes, H256, U256};
use ethers_core::utils::keccak256;
use serde::{Deserialize, Serialize};

/// EIP-4337 pseudo-transaction in the EntryPoint v0.6 layout
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    /// ABI encoding of every field but the signature, with dynamic byte
    /// fields replaced by their keccak256 digests.
    pub fn pack(&self) -> Vec<u8> {
        encode(&[
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::FixedBytes(keccak256(&self.init_code).to_vec()),
            Token::FixedBytes(keccak256(&self.call_data).to_vec()),
            Token::Uint(self.call_gas_limit),
            Token::Uint(self.verification_gas_limit),
            Token::Uint(self.pre_verification_gas),
            Token::Uint(self.max_fee_per_gas),
            Token::Uint(self.max_priority_fee_per_gas),
            Token::FixedBytes(keccak256(&self.paymaster_and_data).to_vec()),
        ])
    }

    /// The hash the account owner signs, bound to one entry point and chain
    pub fn hash(&self, entry_point: Address, chain_id: u64) -> H256 {
        let inner = keccak256(self.pack());
        let outer = encode(&[
            Token::FixedBytes(inner.to_vec()),
            Token::Address(entry_point),
            Token::Uint(U256::from(chain_id)),
        ]);
        H256::from(keccak256(outer))
    }

    /// Highest amount of wei the operation can cost before refunds
    pub fn max_cost(&self) -> U256 {
        let gas = self
            .call_gas_limit
            .saturating_add(self.verification_gas_limit)
            .saturating_add(self.pre_verification_gas);
        gas.saturating_mul(self.max_fee_per_gas)
    }

    pub fn is_sponsored(&self) -> bool {
        self.paymaster_and_data.len() >= 20
    }

    /// Paymaster address encoded in the first 20 bytes of `paymaster_and_data`
    pub fn paymaster(&self) -> Option<Address> {
        if self.is_sponsored() {
            Some(Address::from_slice(&self.paymaster_and_data[..20]))
        } else {
            None
        }
    }
}
