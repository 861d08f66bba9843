// pakfile.rs — PAK directory packing for side lumps
//
// Static prop lighting files ride inside the map in a PAK-format lump:
// "PACK" header, raw file data, then a directory of 64-byte entries.

pub const IDPAKHEADER: i32 =
    (b'K' as i32) << 24 | (b'C' as i32) << 16 | (b'A' as i32) << 8 | b'P' as i32;

pub const MAX_PAK_NAME: usize = 56;
pub const PAK_ENTRY_SIZE: usize = 64;
pub const PAK_HEADER_SIZE: usize = 12;

/// Serialize (name, data) pairs into a single PAK image. Names longer
/// than the 56-byte field are rejected by truncation at build time; the
/// lighting tool never generates such names.
pub fn build_pak(entries: &[(String, Vec<u8>)]) -> Vec<u8> {
    if entries.is_empty() {
        return Vec::new();
    }
    let mut out = vec![0u8; PAK_HEADER_SIZE];
    let mut dir = Vec::with_capacity(entries.len() * PAK_ENTRY_SIZE);

    for (name, data) in entries {
        let filepos = out.len() as i32;
        out.extend_from_slice(data);

        let mut name_field = [0u8; MAX_PAK_NAME];
        let bytes = name.as_bytes();
        let n = bytes.len().min(MAX_PAK_NAME - 1);
        name_field[..n].copy_from_slice(&bytes[..n]);
        dir.extend_from_slice(&name_field);
        dir.extend_from_slice(&filepos.to_le_bytes());
        dir.extend_from_slice(&(data.len() as i32).to_le_bytes());
    }

    let dirofs = out.len() as i32;
    let dirlen = dir.len() as i32;
    out.extend_from_slice(&dir);
    out[0..4].copy_from_slice(&IDPAKHEADER.to_le_bytes());
    out[4..8].copy_from_slice(&dirofs.to_le_bytes());
    out[8..12].copy_from_slice(&dirlen.to_le_bytes());
    out
}

/// Parse a PAK image back into (name, data) pairs. Returns None for an
/// empty or malformed image.
pub fn parse_pak(data: &[u8]) -> Option<Vec<(String, Vec<u8>)>> {
    if data.len() < PAK_HEADER_SIZE {
        return None;
    }
    let ident = i32::from_le_bytes(data[0..4].try_into().unwrap());
    if ident != IDPAKHEADER {
        return None;
    }
    let dirofs = i32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
    let dirlen = i32::from_le_bytes(data[8..12].try_into().unwrap()) as usize;
    if dirofs + dirlen > data.len() || dirlen % PAK_ENTRY_SIZE != 0 {
        return None;
    }

    let mut entries = Vec::with_capacity(dirlen / PAK_ENTRY_SIZE);
    for i in 0..dirlen / PAK_ENTRY_SIZE {
        let e = dirofs + i * PAK_ENTRY_SIZE;
        let name_field = &data[e..e + MAX_PAK_NAME];
        let end = name_field
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(MAX_PAK_NAME);
        let name = String::from_utf8_lossy(&name_field[..end]).into_owned();
        let filepos =
            i32::from_le_bytes(data[e + 56..e + 60].try_into().unwrap()) as usize;
        let filelen =
            i32::from_le_bytes(data[e + 60..e + 64].try_into().unwrap()) as usize;
        if filepos + filelen > data.len() {
            return None;
        }
        entries.push((name, data[filepos..filepos + filelen].to_vec()));
    }
    Some(entries)
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let entries = vec![
            ("sp_0.vhv".to_string(), vec![1u8, 2, 3, 4]),
            ("texelslighting_0.ppl".to_string(), vec![9u8; 100]),
        ];
        let pak = build_pak(&entries);
        let back = parse_pak(&pak).unwrap();
        assert_eq!(entries, back);
    }

    #[test]
    fn test_empty() {
        assert!(build_pak(&[]).is_empty());
        assert!(parse_pak(&[]).is_none());
    }

    #[test]
    fn test_rejects_bad_ident() {
        let mut pak = build_pak(&[("a".to_string(), vec![0u8; 8])]);
        pak[0] = b'X';
        assert!(parse_pak(&pak).is_none());
    }
}
