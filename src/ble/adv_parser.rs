use heapless::String;

use crate::config::MAX_NAME_LEN;

/// AD type: shortened local name.
pub const AD_NAME_SHORTENED: u8 = 0x08;
/// AD type: complete local name.
pub const AD_NAME_COMPLETE: u8 = 0x09;

/// Iterate `(ad_type, payload)` pairs of raw advertisement data.
///
/// Stops at the first zero-length or truncated structure.
pub fn ad_structures(data: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    let mut i = 0;
    core::iter::from_fn(move || {
        let len = *data.get(i)? as usize;
        if len == 0 || i + len >= data.len() {
            return None;
        }
        let ad_type = data[i + 1];
        let payload = &data[i + 2..i + 1 + len];
        i += len + 1;
        Some((ad_type, payload))
    })
}

/// Extract the complete or shortened local name, truncated to
/// [`MAX_NAME_LEN`] bytes. Non-ASCII bytes are replaced by `?`.
pub fn extract_device_name(data: &[u8]) -> Option<String<MAX_NAME_LEN>> {
    let (_, name_bytes) = ad_structures(data)
        .find(|(t, _)| *t == AD_NAME_SHORTENED || *t == AD_NAME_COMPLETE)?;
    let mut name = String::new();
    for &b in name_bytes {
        let c = if b.is_ascii() && !b.is_ascii_control() { b as char } else { '?' };
        if name.push(c).is_err() {
            break;
        }
    }
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_complete_name_after_flags() {
        let adv = [
            0x02, 0x01, 0x06, // flags
            0x06, 0x09, b'T', b'h', b'i', b'n', b'g',
        ];
        assert_eq!(extract_device_name(&adv).unwrap().as_str(), "Thing");
    }

    #[test]
    fn no_name_is_none() {
        let adv = [0x02, 0x01, 0x06, 0x03, 0x03, 0x0F, 0x18];
        assert!(extract_device_name(&adv).is_none());
    }

    #[test]
    fn truncated_structure_stops_parsing() {
        let adv = [0x02, 0x01, 0x06, 0x09, 0x09, b'A', b'B'];
        assert_eq!(ad_structures(&adv).count(), 1);
        assert!(extract_device_name(&adv).is_none());
    }

    #[test]
    fn long_name_is_truncated() {
        let mut adv = [b'x'; 42];
        adv[0] = 41;
        adv[1] = AD_NAME_COMPLETE;
        assert_eq!(extract_device_name(&adv).unwrap().len(), MAX_NAME_LEN);
    }
}
