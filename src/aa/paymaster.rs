use ethers_core::types::{Address, Bytes, U256};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::Result;
use crate::models::UserOperation;
use crate::rpc::{self, RpcTransport};

/// How gas for a user operation is paid
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PaymasterMode {
    /// The smart account pays from its own EntryPoint deposit
    #[default]
    None,
    /// A fixed `paymasterAndData` blob
    Static(Bytes),
    /// Ask a sponsoring paymaster service via `pm_sponsorUserOperation`.
    /// Without a url the bundler endpoint is asked.
    Sponsored {
        url: Option<String>,
        policy_id: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SponsorFields {
    paymaster_and_data: Bytes,
    #[serde(default)]
    pre_verification_gas: Option<U256>,
    #[serde(default)]
    verification_gas_limit: Option<U256>,
    #[serde(default)]
    call_gas_limit: Option<U256>,
}

/// Paymaster services answer either with the bare blob or with gas overrides
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SponsorResponse {
    Blob(Bytes),
    Fields(SponsorFields),
}

/// Ask the paymaster to sponsor `op`, applying whatever it returns
pub async fn sponsor(
    transport: &dyn RpcTransport,
    op: &mut UserOperation,
    entry_point: Address,
    policy_id: Option<&str>,
) -> Result<()> {
    let mut params = vec![json!(op), json!(entry_point)];
    if let Some(policy_id) = policy_id {
        params.push(json!({ "policyId": policy_id }));
    }

    let response: SponsorResponse =
        rpc::call(transport, "pm_sponsorUserOperation", Value::Array(params)).await?;

    match response {
        SponsorResponse::Blob(data) => op.paymaster_and_data = data,
        SponsorResponse::Fields(fields) => {
            op.paymaster_and_data = fields.paymaster_and_data;
            if let Some(gas) = fields.pre_verification_gas {
                op.pre_verification_gas = gas;
            }
            if let Some(gas) = fields.verification_gas_limit {
                op.verification_gas_limit = gas;
            }
            if let Some(gas) = fields.call_gas_limit {
                op.call_gas_limit = gas;
            }
        }
    }

    debug!(paymaster = ?op.paymaster(), "Paymaster sponsored user operation");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::mock::MockTransport;

    #[tokio::test]
    async fn applies_blob_response() {
        let mock = MockTransport::new();
        mock.respond("pm_sponsorUserOperation", json!(format!("0x{}", "42".repeat(20))));

        let mut op = UserOperation::default();
        sponsor(&mock, &mut op, Address::repeat_byte(0x5f), None).await.unwrap();

        assert_eq!(op.paymaster(), Some(Address::repeat_byte(0x42)));
        assert_eq!(mock.calls_to("pm_sponsorUserOperation")[0].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn applies_gas_overrides_and_policy() {
        let mock = MockTransport::new();
        mock.respond(
            "pm_sponsorUserOperation",
            json!({
                "paymasterAndData": format!("0x{}", "43".repeat(52)),
                "preVerificationGas": "0xc350",
                "verificationGasLimit": "0x30d40"
            }),
        );

        let mut op = UserOperation {
            call_gas_limit: U256::from(7),
            ..Default::default()
        };
        sponsor(&mock, &mut op, Address::repeat_byte(0x5f), Some("policy-9")).await.unwrap();

        assert_eq!(op.pre_verification_gas, U256::from(50_000));
        assert_eq!(op.verification_gas_limit, U256::from(200_000));
        assert_eq!(op.call_gas_limit, U256::from(7));
        assert_eq!(op.paymaster_and_data.len(), 52);

        let params = &mock.calls_to("pm_sponsorUserOperation")[0];
        assert_eq!(params[2]["policyId"], "policy-9");
    }
}
