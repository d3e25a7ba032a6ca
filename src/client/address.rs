//! TON address forms: raw `wc:hex` and user-friendly base64

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;

use crate::session::ledger::{LedgerError, RawAddress};

const BOUNCEABLE_TAG: u8 = 0x11;
const NON_BOUNCEABLE_TAG: u8 = 0x51;
const TEST_ONLY_FLAG: u8 = 0x80;
const FRIENDLY_LEN: usize = 36;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedAddress {
    pub raw: RawAddress,
    pub bounceable: bool,
    pub test_only: bool,
}

/// CRC-16/XMODEM, as used by the friendly address checksum.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
    }
    crc
}

/// Accepts `wc:hex` or a 48-char friendly address in either base64 alphabet.
pub fn parse_address(address: &str) -> Result<ParsedAddress, LedgerError> {
    if address.contains(':') {
        return Ok(ParsedAddress {
            raw: address.parse()?,
            bounceable: true,
            test_only: false,
        });
    }

    let invalid = || LedgerError::InvalidAddress(address.to_string());
    let bytes = URL_SAFE
        .decode(address)
        .or_else(|_| STANDARD.decode(address))
        .map_err(|_| invalid())?;
    if bytes.len() != FRIENDLY_LEN {
        return Err(invalid());
    }

    let (body, checksum) = bytes.split_at(34);
    if crc16(body) != u16::from_be_bytes([checksum[0], checksum[1]]) {
        return Err(invalid());
    }

    let tag = body[0];
    let test_only = tag & TEST_ONLY_FLAG != 0;
    let bounceable = match tag & !TEST_ONLY_FLAG {
        BOUNCEABLE_TAG => true,
        NON_BOUNCEABLE_TAG => false,
        _ => return Err(invalid()),
    };
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&body[2..34]);

    Ok(ParsedAddress {
        raw: RawAddress {
            workchain: body[1] as i8 as i32,
            hash,
        },
        bounceable,
        test_only,
    })
}

pub fn to_friendly(raw: &RawAddress, bounceable: bool, test_only: bool) -> String {
    let mut tag = if bounceable { BOUNCEABLE_TAG } else { NON_BOUNCEABLE_TAG };
    if test_only {
        tag |= TEST_ONLY_FLAG;
    }

    let mut bytes = Vec::with_capacity(FRIENDLY_LEN);
    bytes.push(tag);
    bytes.push(raw.workchain as i8 as u8);
    bytes.extend_from_slice(&raw.hash);
    let crc = crc16(&bytes);
    bytes.extend_from_slice(&crc.to_be_bytes());
    URL_SAFE.encode(bytes)
}
