//! Code page 437, the legacy ZIP name encoding

const HIGH_HALF: [&str; 8] = [
    "ÇüéâäàåçêëèïîìÄÅ",
    "ÉæÆôöòûùÿÖÜ¢£¥₧ƒ",
    "áíóúñÑªº¿⌐¬½¼¡«»",
    "░▒▓│┤╡╢╖╕╣║╗╝╜╛┐",
    "└┴┬├─┼╞╟╚╔╩╦╠═╬╧",
    "╨╤╥╙╘╒╓╫╪┘┌█▄▌▐▀",
    "αßΓπΣσµτΦΘΩδ∞φε∩",
    "≡±≥≤⌠⌡÷≈°∙·√ⁿ²■\u{a0}",
];

/// Decode code page 437 bytes
pub fn decode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b < 0x80 {
                b as char
            } else {
                let high = (b - 0x80) as usize;
                HIGH_HALF[high / 16]
                    .chars()
                    .nth(high % 16)
                    .unwrap_or(char::REPLACEMENT_CHARACTER)
            }
        })
        .collect()
}

/// Decode a ZIP name honouring the UTF-8 flag
pub fn decode_name(bytes: &[u8], utf8: bool) -> String {
    if utf8 {
        String::from_utf8_lossy(bytes).into_owned()
    } else {
        decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_rows_are_complete() {
        for row in HIGH_HALF {
            assert_eq!(row.chars().count(), 16);
        }
    }

    #[test]
    fn test_decode() {
        assert_eq!(decode(b"plain.txt"), "plain.txt");
        assert_eq!(decode(&[0x80, b'a', 0xE1]), "Çaß");
        assert_eq!(decode_name("naïve".as_bytes(), true), "naïve");
    }
}
