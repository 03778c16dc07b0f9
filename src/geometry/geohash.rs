//! Base32 geohash encoding for the `HASHES precision` output shape.

const BASE32: &[u8] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Encode (lat, lon) to a geohash string of the given character length
/// (1..=12, per the wire command's precision argument).
pub fn encode(lat: f64, lon: f64, precision: usize) -> String {
    let precision = precision.clamp(1, 12);
    let mut out = String::with_capacity(precision);
    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let (mut lon_lo, mut lon_hi) = (-180.0_f64, 180.0_f64);
    let mut even_bit = true;
    let mut bit = 0u8;
    let mut ch = 0u8;

    while out.len() < precision {
        if even_bit {
            let mid = (lon_lo + lon_hi) / 2.0;
            if lon >= mid {
                ch |= 1 << (4 - bit);
                lon_lo = mid;
            } else {
                lon_hi = mid;
            }
        } else {
            let mid = (lat_lo + lat_hi) / 2.0;
            if lat >= mid {
                ch |= 1 << (4 - bit);
                lat_lo = mid;
            } else {
                lat_hi = mid;
            }
        }
        even_bit = !even_bit;
        if bit < 4 {
            bit += 1;
        } else {
            out.push(BASE32[ch as usize] as char);
            bit = 0;
            ch = 0;
        }
    }
    out
}

/// Decode a geohash string back to the bounding rectangle it represents
/// (the `HASH gh` area form).
pub fn decode(hash: &str) -> Option<super::Rect> {
    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let (mut lon_lo, mut lon_hi) = (-180.0_f64, 180.0_f64);
    let mut even_bit = true;
    for c in hash.chars() {
        let cd = BASE32.iter().position(|&b| b as char == c)?;
        for i in (0..5).rev() {
            let bit = (cd >> i) & 1;
            if even_bit {
                let mid = (lon_lo + lon_hi) / 2.0;
                if bit == 1 { lon_lo = mid } else { lon_hi = mid }
            } else {
                let mid = (lat_lo + lat_hi) / 2.0;
                if bit == 1 { lat_lo = mid } else { lat_hi = mid }
            }
            even_bit = !even_bit;
        }
    }
    Some(super::Rect { min_lat: lat_lo, min_lon: lon_lo, max_lat: lat_hi, max_lon: lon_hi })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_known_point() {
        // Standard geohash test vector.
        let hash = encode(57.64911, 10.40744, 6);
        assert_eq!(hash, "u4pruy");
    }

    #[test]
    fn clamps_precision() {
        assert_eq!(encode(0.0, 0.0, 0).len(), 1);
        assert_eq!(encode(0.0, 0.0, 99).len(), 12);
    }
}
