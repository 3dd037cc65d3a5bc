use alloy::primitives::U256;

const ERROR_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
const PANIC_SELECTOR: [u8; 4] = [0x4e, 0x48, 0x7b, 0x71];

/// Turn the return data of a failed execution into a readable message.
///
/// Empty data is a bare `require(false)`. ABI-shaped data is either
/// `Error(string)` or `Panic(uint256)`; anything else with a four-byte
/// selector is a custom error this decoder cannot name.
pub fn decode_revert_reason(data: &[u8]) -> String {
    if data.is_empty() {
        return "require(false)".to_string();
    }

    if data.len() % 32 != 4 {
        return "could not decode reason; invalid data length".to_string();
    }

    let selector: [u8; 4] = data[..4].try_into().unwrap();
    let body = &data[4..];

    match selector {
        ERROR_SELECTOR => decode_error_string(body)
            .unwrap_or_else(|| "could not decode reason; invalid data length".to_string()),
        PANIC_SELECTOR if body.len() >= 32 => {
            let code = U256::from_be_slice(&body[..32]);
            format!("Panic({})", panic_symbol(code))
        }
        _ => format!("unknown custom error (selector 0x{})", hex::encode(selector)),
    }
}

fn decode_error_string(body: &[u8]) -> Option<String> {
    if body.len() < 64 {
        return None;
    }

    let offset: usize = usize::try_from(U256::from_be_slice(&body[..32])).ok()?;
    let length: usize = usize::try_from(U256::from_be_slice(body.get(offset..offset + 32)?)).ok()?;
    let bytes = body.get(offset + 32..offset + 32 + length)?;

    Some(String::from_utf8_lossy(bytes).into_owned())
}

fn panic_symbol(code: U256) -> &'static str {
    match u64::try_from(code).unwrap_or(u64::MAX) {
        0x00 => "GENERIC_PANIC",
        0x01 => "ASSERT_FALSE",
        0x11 => "OVERFLOW",
        0x12 => "DIVIDE_BY_ZERO",
        0x21 => "ENUM_RANGE_ERROR",
        0x22 => "BAD_STORAGE_DATA",
        0x31 => "STACK_UNDERFLOW",
        0x32 => "ARRAY_RANGE_ERROR",
        0x41 => "OUT_OF_MEMORY",
        0x51 => "UNINITIALIZED_FUNCTION_CALL",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abi_error(reason: &str) -> Vec<u8> {
        let mut data = ERROR_SELECTOR.to_vec();
        data.extend_from_slice(&U256::from(32).to_be_bytes::<32>());
        data.extend_from_slice(&U256::from(reason.len()).to_be_bytes::<32>());
        let mut padded = reason.as_bytes().to_vec();
        padded.resize(reason.len().div_ceil(32) * 32, 0);
        data.extend_from_slice(&padded);
        data
    }

    #[test]
    fn empty_data_is_bare_require() {
        assert_eq!(decode_revert_reason(&[]), "require(false)");
    }

    #[test]
    fn misaligned_data_is_rejected() {
        assert_eq!(
            decode_revert_reason(&[0x01, 0x02, 0x03]),
            "could not decode reason; invalid data length"
        );
    }

    #[test]
    fn decodes_error_string() {
        assert_eq!(
            decode_revert_reason(&abi_error("Insufficient balance")),
            "Insufficient balance"
        );
    }

    #[test]
    fn decodes_panic_codes() {
        let mut data = PANIC_SELECTOR.to_vec();
        data.extend_from_slice(&U256::from(0x11).to_be_bytes::<32>());
        assert_eq!(decode_revert_reason(&data), "Panic(OVERFLOW)");

        let mut data = PANIC_SELECTOR.to_vec();
        data.extend_from_slice(&U256::from(0x99).to_be_bytes::<32>());
        assert_eq!(decode_revert_reason(&data), "Panic(UNKNOWN)");
    }

    #[test]
    fn unknown_selector_is_reported() {
        let mut data = vec![0xde, 0xad, 0xbe, 0xef];
        data.extend_from_slice(&[0u8; 32]);
        assert_eq!(
            decode_revert_reason(&data),
            "unknown custom error (selector 0xdeadbeef)"
        );
    }
}
