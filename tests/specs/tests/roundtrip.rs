// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Round-trip laws and boundary behaviors.

use proptest::prelude::*;

use vigild::codec::{nldecode, nlencode};

proptest! {
    #[test]
    fn nlencode_nldecode_is_identity(s in "\\PC*") {
        prop_assert_eq!(nldecode(&nlencode(&s)), s);
    }

    #[test]
    fn nlencode_output_is_field_safe(s in ".*") {
        let encoded = nlencode(&s);
        prop_assert!(!encoded.contains('|'));
        prop_assert!(!encoded.contains('\n'));
    }
}

#[test]
fn nlencode_handles_control_bytes() {
    let s = "a|b\\c\nd\re\tf";
    assert_eq!(nldecode(&nlencode(s)), s);
}

#[test]
fn extcombo_preserves_bytes() {
    let inner1: &[u8] = b"status a.t red\n\xc3\xa9 accents kept\n";
    let inner2: &[u8] = b"data b.trends\n1 2 3\n";
    let start = 40;
    let mut header = format!(
        "extcombo {} {} {}",
        start,
        start + inner1.len(),
        start + inner1.len() + inner2.len()
    );
    while header.len() < start - 1 {
        header.push(' ');
    }
    header.push('\n');
    let mut buf = header.into_bytes();
    buf.extend_from_slice(inner1);
    buf.extend_from_slice(inner2);

    let parts = vigild::codec::split_extcombo(&buf).unwrap();
    assert_eq!(parts, vec![inner1, inner2]);
}
