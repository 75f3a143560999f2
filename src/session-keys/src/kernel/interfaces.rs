//! Solidity ABI interface scaffolding for Kernel accounts.
//!
//! These declarations keep the call encodings the gateway produces (and the in-memory
//! ledger consumes) byte-compatible with Kernel v3 and the v0.7 EntryPoint.

use alloy_sol_types::sol;

sol! {
    /// ERC-4337 v0.7 packed user operation.
    struct PackedUserOperation {
        address sender;
        uint256 nonce;
        bytes initCode;
        bytes callData;
        bytes32 accountGasLimits;
        uint256 preVerificationGas;
        bytes32 gasFees;
        bytes paymasterAndData;
        bytes signature;
    }

    /// ERC-7579 batch execution item.
    struct Execution {
        address target;
        uint256 value;
        bytes callData;
    }

    /// Kernel v3 per-validation configuration.
    struct ValidationConfig {
        uint32 nonce;
        address hook;
    }

    interface IKernel {
        function execute(bytes32 execMode, bytes executionCalldata) external payable;
        function installValidations(
            bytes21[] vIds,
            ValidationConfig[] configs,
            bytes[] validationData,
            bytes[] hookData
        ) external payable;
        function uninstallValidation(bytes21 vId, bytes deinitData, bytes hookDeinitData) external payable;
    }
}
