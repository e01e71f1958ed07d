//! Derivative symbol helpers.
//!
//! Option symbols follow the broker convention
//! `{UNDERLYING}{EXPIRY}{STRIKE}{CE|PE}`, e.g. `NIFTY28OCT2625000CE`.
//! Futures append `FUT` to `{UNDERLYING}{EXPIRY}`.

use super::enums::OptionType;

/// Underlyings whose names are prefixes of others must be checked longest
/// first (`BANKNIFTY` before `NIFTY`).
const KNOWN_UNDERLYINGS: [&str; 6] = ["MIDCPNIFTY", "BANKNIFTY", "FINNIFTY", "BANKEX", "SENSEX", "NIFTY"];

/// Build an option trading symbol.
#[inline]
pub fn option_symbol(underlying: &str, expiry: &str, strike: i64, option_type: OptionType) -> String {
    format!("{underlying}{expiry}{strike}{}", option_type.suffix())
}

/// Build a futures trading symbol.
#[inline]
pub fn futures_symbol(underlying: &str, expiry: &str) -> String {
    format!("{underlying}{expiry}FUT")
}

/// Extract the underlying name from a derivative symbol.
///
/// Known index names are matched by prefix; anything else falls back to the
/// leading alphabetic run (`RELIANCE28OCT26FUT` → `RELIANCE`).
pub fn base_symbol(symbol: &str) -> &str {
    let known = KNOWN_UNDERLYINGS.iter().find_map(|name| {
        symbol.get(..name.len()).filter(|head| head.eq_ignore_ascii_case(name))
    });
    if let Some(head) = known {
        return head;
    }
    let end = symbol
        .char_indices()
        .find(|(_, c)| !c.is_ascii_alphabetic())
        .map(|(i, _)| i)
        .unwrap_or(symbol.len());
    &symbol[..end]
}

/// Option type from the symbol suffix, `None` for futures/equity.
pub fn option_type_of(symbol: &str) -> Option<OptionType> {
    if symbol.ends_with("CE") {
        Some(OptionType::Call)
    } else if symbol.ends_with("PE") {
        Some(OptionType::Put)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_option_symbol() {
        assert_eq!(option_symbol("NIFTY", "17JUL25", 24500, OptionType::Call), "NIFTY17JUL2524500CE");
        assert_eq!(futures_symbol("BANKNIFTY", "28OCT26"), "BANKNIFTY28OCT26FUT");
    }

    #[test]
    fn banknifty_is_not_nifty() {
        assert_eq!(base_symbol("BANKNIFTY28OCT2652000PE"), "BANKNIFTY");
        assert_eq!(base_symbol("NIFTY28OCT2625000CE"), "NIFTY");
        assert_eq!(base_symbol("SENSEX30OCT2682000CE"), "SENSEX");
        assert_eq!(base_symbol("RELIANCE28OCT26FUT"), "RELIANCE");
    }

    #[test]
    fn non_ascii_input_does_not_split_a_char() {
        // 'é' straddles byte 5, the length of "NIFTY"
        assert_eq!(base_symbol("NIFTé28OCT26FUT"), "NIFT");
        assert_eq!(base_symbol("€"), "");
        assert_eq!(base_symbol(""), "");
    }

    #[test]
    fn option_suffix() {
        assert_eq!(option_type_of("NIFTY17JUL2524500PE"), Some(OptionType::Put));
        assert_eq!(option_type_of("NIFTY28OCT26FUT"), None);
    }
}
