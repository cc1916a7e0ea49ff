//! LLSD XML codec tests: serialize→parse identity across the type set.

#[cfg(test)]
mod tests {
    use uuid::Uuid;
    use veldt_region::llsd::{from_xml, to_xml, Llsd};

    fn round_trip(value: Llsd) {
        let xml = to_xml(&value);
        let back = from_xml(&xml).unwrap_or_else(|e| panic!("parse failed for {}: {}", xml, e));
        assert_eq!(back, value, "round trip mismatch for {}", xml);
    }

    // -----------------------------------------------------------------------
    // Scalars
    // -----------------------------------------------------------------------

    #[test]
    fn scalars_round_trip() {
        round_trip(Llsd::Undef);
        round_trip(Llsd::Bool(true));
        round_trip(Llsd::Bool(false));
        round_trip(Llsd::Int(0));
        round_trip(Llsd::Int(-123456));
        round_trip(Llsd::Real(0.0));
        round_trip(Llsd::Real(1.5));
        round_trip(Llsd::Real(-2.25e-3));
        round_trip(Llsd::Uuid(Uuid::nil()));
        round_trip(Llsd::Uuid(Uuid::new_v4()));
        round_trip(Llsd::String(String::new()));
        round_trip(Llsd::String("hello world".to_string()));
        round_trip(Llsd::Uri("http://example.com/CAPS/x".to_string()));
    }

    #[test]
    fn strings_with_markup_survive_escaping() {
        round_trip(Llsd::String("<script> & \"friends\" </script>".to_string()));
    }

    #[test]
    fn binary_round_trips_via_base64() {
        round_trip(Llsd::Binary(vec![]));
        round_trip(Llsd::Binary((0u8..=255).collect()));
    }

    // -----------------------------------------------------------------------
    // Containers
    // -----------------------------------------------------------------------

    #[test]
    fn containers_round_trip_preserving_order() {
        let mut map = Llsd::map();
        map.insert("zebra", Llsd::Int(1));
        map.insert("aardvark", Llsd::String("second".to_string()));
        map.insert("nested", {
            let mut inner = Llsd::array();
            inner.push(Llsd::Bool(true));
            inner.push(Llsd::Undef);
            inner.push(Llsd::Real(9.75));
            inner
        });
        round_trip(map);
    }

    #[test]
    fn empty_containers_round_trip() {
        round_trip(Llsd::array());
        round_trip(Llsd::map());
    }

    // -----------------------------------------------------------------------
    // Parser behavior
    // -----------------------------------------------------------------------

    #[test]
    fn parses_self_closing_scalars() {
        let v = from_xml("<llsd><map><key>k</key><string/></map></llsd>").unwrap();
        assert_eq!(v.get("k").and_then(|s| s.as_str()), Some(""));
    }

    #[test]
    fn boolean_spellings() {
        let v = from_xml("<llsd><boolean>1</boolean></llsd>").unwrap();
        assert_eq!(v.as_bool(), Some(true));
        let v = from_xml("<llsd><boolean>false</boolean></llsd>").unwrap();
        assert_eq!(v.as_bool(), Some(false));
    }

    #[test]
    fn rejects_malformed_documents() {
        assert!(from_xml("<llsd><integer>12").is_err());
        assert!(from_xml("<llsd><map><integer>1</integer></map></llsd>").is_err());
        assert!(from_xml("not xml at all").is_err());
    }

    #[test]
    fn depth_limit_holds() {
        let mut doc = String::from("<llsd>");
        for _ in 0..40 {
            doc.push_str("<array>");
        }
        for _ in 0..40 {
            doc.push_str("</array>");
        }
        doc.push_str("</llsd>");
        assert!(from_xml(&doc).is_err());
    }
}
