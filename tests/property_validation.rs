//! Property-based query validation and rendering tests (proptest).

use proptest::prelude::*;
use serde_json::{json, Value};

use superproxy::config::QueryLimits;
use superproxy::query::validate;
use superproxy::render::{to_delimited, CsvOptions};
use superproxy::QueryDraft;

const URL: &str = "https://www.googleapis.com/analytics/v3/data/ga?ids=ga:1";

fn limits() -> QueryLimits {
    QueryLimits::default()
}

proptest! {
    #[test]
    fn prop_interval_accepted_iff_in_range(interval in 0u64..3_000_000) {
        let limits = limits();
        let draft = QueryDraft::new("Sessions", URL, interval);
        let in_range = interval >= limits.min_interval && interval <= limits.max_interval;

        match validate(&draft, &limits) {
            Ok(valid) => {
                prop_assert!(in_range);
                prop_assert_eq!(valid.refresh_interval(), interval);
            }
            Err(e) => {
                prop_assert!(!in_range);
                prop_assert_eq!(e.fields(), vec!["refresh_interval"]);
            }
        }
    }

    #[test]
    fn prop_name_length_limit_counts_characters(len in 1usize..200, ch in prop::sample::select(vec!['a', 'é', '漢'])) {
        let limits = limits();
        let name: String = std::iter::repeat(ch).take(len).collect();
        let draft = QueryDraft::new(name, URL, 3600);

        let result = validate(&draft, &limits);
        prop_assert_eq!(result.is_ok(), len <= limits.max_name_length);
        if let Err(e) = result {
            prop_assert!(e.has_field("name"));
            prop_assert!(!e.has_field("request"));
        }
    }

    #[test]
    fn prop_blank_fields_always_rejected(spaces in "[ \t]{0,8}") {
        let draft = QueryDraft::new(spaces.clone(), spaces, 0);
        let e = validate(&draft, &limits()).unwrap_err();
        prop_assert!(e.has_field("name"));
        prop_assert!(e.has_field("request"));
        prop_assert!(e.has_field("refresh_interval"));
    }

    #[test]
    fn prop_valid_names_are_trimmed(name in "[A-Za-z0-9 :-]{1,40}") {
        prop_assume!(!name.trim().is_empty());
        let padded = format!("  {name}  ");
        let valid = validate(&QueryDraft::new(padded, URL, 3600), &limits()).unwrap();
        prop_assert_eq!(valid.name(), name.trim());
    }

    #[test]
    fn prop_csv_has_one_line_per_row(cells in prop::collection::vec(("[a-z,\" ]{0,6}", 0u32..1000), 0..20)) {
        let rows: Vec<Value> = cells.iter().map(|(s, n)| json!([s, n.to_string()])).collect();
        let content = json!({
            "columnHeaders": [
                {"name": "label", "dataType": "STRING"},
                {"name": "count", "dataType": "INTEGER"}
            ],
            "rows": rows,
        });

        let csv = to_delimited(&content, &CsvOptions::default());
        prop_assert_eq!(csv.lines().count(), cells.len() + 1);
        prop_assert!(csv.starts_with("label,count\n"));
    }
}
