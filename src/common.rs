use pnet::util::MacAddr;

pub const BROADCAST_MAC: [u8; 6] = [ 0xff, 0xff, 0xff, 0xff, 0xff, 0xff ];

/// Number of times the target MAC is repeated after the sync stream.
pub const MAC_REPETITIONS: usize = 16;

/// Sync stream plus sixteen MAC repetitions.
pub const MAGIC_PACKET_LEN: usize = BROADCAST_MAC.len() + MAC_REPETITIONS * 6;


/// Scans `payload` for a Wake-on-LAN magic packet and returns the target MAC.
///
/// The sync stream may start at any offset, so leading wrapper bytes are tolerated,
/// and anything after the 102-byte window (SecureOn password, link padding) is ignored.
/// A repeated all-zero MAC is never reported.
pub fn find_magic_mac(payload: &[u8]) -> Option<MacAddr> {
    if payload.len() < MAGIC_PACKET_LEN { return None; }

    payload.windows(MAGIC_PACKET_LEN).find_map(magic_window_mac)
}

fn magic_window_mac(window: &[u8]) -> Option<MacAddr> {
    let (sync, body) = window.split_at(BROADCAST_MAC.len());
    if sync != BROADCAST_MAC { return None; }

    let target = &body[..6];
    if target.iter().all(|b| *b == 0) { return None; }

    if !body.chunks_exact(6).all(|block| block == target) {
        return None;
    }

    Some(MacAddr::new(target[0], target[1], target[2], target[3], target[4], target[5]))
}

/// Parses a MAC address written in any of the usual hex notations
/// (`aa:bb:cc:dd:ee:ff`, `AA-BB-CC-DD-EE-FF`, `aabb.ccdd.eeff`, `aabbccddeeff`).
pub fn parse_mac(text: &str) -> Option<MacAddr> {
    let digits: Vec<u8> = text.trim()
        .bytes()
        .filter(|b| !matches!(b, b':' | b'-' | b'.'))
        .collect();
    if digits.len() != 12 || !digits.iter().all(u8::is_ascii_hexdigit) { return None; }

    let mut octets = [0u8; 6];
    for (octet, pair) in octets.iter_mut().zip(digits.chunks_exact(2)) {
        let pair = std::str::from_utf8(pair).ok()?;
        *octet = u8::from_str_radix(pair, 16).ok()?;
    }

    let [a, b, c, d, e, f] = octets;
    Some(MacAddr::new(a, b, c, d, e, f))
}

/// Canonical lowercase, colon-separated form of `text`.
pub fn normalize_mac(text: &str) -> Option<String> {
    parse_mac(text).map(|mac| mac.to_string())
}
