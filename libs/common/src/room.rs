//! Canonical two-party room identifiers.

/// Derive the room id shared by two users.
///
/// The lower id (byte-wise) always comes first, so both participants compute
/// the same value without negotiating.
pub fn room_id(a: &str, b: &str) -> String {
    if a < b {
        format!("{a}_{b}")
    } else {
        format!("{b}_{a}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_is_symmetric() {
        let pairs = [
            ("alice", "bob"),
            ("u2", "u10"),
            ("Zed", "adam"),
            ("same", "same"),
            ("", "x"),
        ];
        for (a, b) in pairs {
            assert_eq!(room_id(a, b), room_id(b, a), "pair ({a}, {b})");
        }
    }

    #[test]
    fn room_id_orders_lexicographically() {
        assert_eq!(room_id("bob", "alice"), "alice_bob");
        // Byte-wise, not numeric.
        assert_eq!(room_id("u2", "u10"), "u10_u2");
        // Uppercase sorts before lowercase.
        assert_eq!(room_id("adam", "Zed"), "Zed_adam");
    }
}
