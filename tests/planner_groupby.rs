//! Integration tests for group-by planning
//!
//! Multi-key splits, having push-down, output-name rewriting, and the
//! group-by-only query selection.

mod common;

use common::{
    count, day_bucket, field, january_2020, number_ref, string_ref, sum_of, to_json,
    wiki_external,
};
use quarry::{
    get_query_and_post_transform, ApplySpec, CompareOp, Direction, Expr, ExprType,
    QuerySelection, Record, SplitKey, SplitSpec, Value,
};
use serde_json::json;

fn row(pairs: &[(&str, serde_json::Value)]) -> quarry::Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn tags_ref() -> Expr {
    Expr::reference("tags", ExprType::set_of(ExprType::String))
}

#[test]
fn test_multi_split_always_plans_group_by() {
    let external = wiki_external()
        .with_filter(january_2020())
        .with_split(SplitSpec {
            keys: vec![
                SplitKey::new("day", day_bucket()),
                SplitKey::new("country", string_ref("country")),
            ],
            data_name: "main".to_string(),
        })
        .with_apply(ApplySpec::new("count", count()));
    let plan = get_query_and_post_transform(&external).unwrap();
    let doc = to_json(&plan.query);

    assert_eq!(field(&doc, "queryType"), "groupBy");
    assert_eq!(field(&doc, "granularity"), "all");
    // the day bucket rides on a virtual column
    assert_eq!(
        field(&doc, "virtualColumns.0.name"),
        &json!("v:day")
    );
    assert_eq!(
        field(&doc, "dimensions.0"),
        &json!({"type": "default", "dimension": "v:day", "outputName": "day", "outputType": "LONG"})
    );
    assert_eq!(
        field(&doc, "dimensions.1"),
        &json!({"type": "default", "dimension": "country", "outputName": "country"})
    );
}

#[test]
fn test_group_by_only_selection_collapses_shapes() {
    // a sorted, limited single split that would otherwise be a topN
    let external = wiki_external()
        .with_filter(january_2020())
        .with_split(SplitSpec::single("country", string_ref("country")))
        .with_apply(ApplySpec::new("revenue", sum_of("added")))
        .with_sort("revenue", Direction::Descending)
        .with_limit(50)
        .with_query_selection(QuerySelection::GroupByOnly);
    let plan = get_query_and_post_transform(&external).unwrap();
    let doc = to_json(&plan.query);
    assert_eq!(field(&doc, "queryType"), "groupBy");
    assert_eq!(
        field(&doc, "limitSpec"),
        &json!({
            "type": "default",
            "limit": 50,
            "columns": [{"dimension": "revenue", "direction": "descending"}]
        })
    );
}

#[test]
fn test_zero_dimension_group_by_for_totals() {
    let external = wiki_external()
        .with_filter(january_2020())
        .with_apply(ApplySpec::new("count", count()))
        .with_query_selection(QuerySelection::GroupByOnly);
    let plan = get_query_and_post_transform(&external).unwrap();
    let doc = to_json(&plan.query);
    assert_eq!(field(&doc, "queryType"), "groupBy");
    assert_eq!(field(&doc, "dimensions"), &json!([]));
}

#[test]
fn test_having_pushdown_into_list_filtered_dimension() {
    let having = Expr::And(vec![
        Expr::In {
            operand: Box::new(tags_ref()),
            values: Box::new(Expr::Literal(Value::StringSet(vec![
                "a".to_string(),
                "b".to_string(),
            ]))),
        },
        Expr::Compare {
            op: CompareOp::Greater,
            left: Box::new(number_ref("count")),
            right: Box::new(Expr::Literal(Value::Number(10.0))),
        },
    ]);
    // `tags` in the having references the split key's output label
    let external = wiki_external()
        .with_filter(january_2020())
        .with_split(SplitSpec::single("tags", tags_ref()))
        .with_apply(ApplySpec::new("count", count()))
        .with_having_filter(having)
        .with_query_selection(QuerySelection::GroupByOnly);
    let plan = get_query_and_post_transform(&external).unwrap();
    let doc = to_json(&plan.query);

    assert_eq!(
        field(&doc, "dimensions.0"),
        &json!({
            "type": "listFiltered",
            "delegate": {"type": "default", "dimension": "tags", "outputName": "tags"},
            "values": ["a", "b"]
        })
    );
    // only the count constraint survives as a having clause
    assert_eq!(
        field(&doc, "having"),
        &json!({"type": "greaterThan", "aggregation": "count", "value": 10.0})
    );
}

#[test]
fn test_regex_having_pushdown() {
    let having = Expr::Match {
        operand: Box::new(tags_ref()),
        regex: "^release-.*".to_string(),
    };
    let external = wiki_external()
        .with_filter(january_2020())
        .with_split(SplitSpec::single("tags", tags_ref()))
        .with_apply(ApplySpec::new("count", count()))
        .with_having_filter(having);
    let plan = get_query_and_post_transform(&external).unwrap();
    let doc = to_json(&plan.query);
    assert_eq!(field(&doc, "dimensions.0.type"), "regexFiltered");
    assert_eq!(field(&doc, "dimensions.0.pattern"), "^release-.*");
    assert!(doc.get("having").is_none());
}

#[test]
fn test_reserved_output_name_is_rewritten_and_restored() {
    let external = wiki_external()
        .with_filter(january_2020())
        .with_split(SplitSpec::single("__secret", string_ref("country")))
        .with_apply(ApplySpec::new("count", count()));
    let plan = get_query_and_post_transform(&external).unwrap();
    let doc = to_json(&plan.query);

    assert_eq!(
        field(&doc, "dimensions.0.outputName"),
        &json!("***__secret")
    );
    assert_eq!(plan.context.dummy_prefix.as_deref(), Some("***"));

    // the transform strips the prefix on the way back
    let record = plan.post_transform.transform(&row(&[
        ("***__secret", json!("UK")),
        ("count", json!(3)),
    ]));
    match record {
        Record::Datum(datum) => {
            assert_eq!(datum.get("__secret"), Some(&Value::String("UK".to_string())));
            assert!(datum.get("***__secret").is_none());
        }
        other => panic!("expected datum, got {:?}", other),
    }
}

#[test]
fn test_numeric_sorted_split_sets_dimension_order() {
    let external = wiki_external()
        .with_filter(january_2020())
        .with_split(SplitSpec::single("added", number_ref("added")))
        .with_apply(ApplySpec::new("count", count()))
        .with_sort("added", Direction::Ascending)
        .with_query_selection(QuerySelection::GroupByOnly);
    let plan = get_query_and_post_transform(&external).unwrap();
    assert_eq!(
        field(&to_json(&plan.query), "limitSpec.columns.0"),
        &json!({"dimension": "added", "direction": "ascending", "dimensionOrder": "numeric"})
    );
}

#[test]
fn test_intermediate_aggregations_are_dropped_from_output() {
    let avg = Expr::Divide(Box::new(sum_of("added")), Box::new(count()));
    let external = wiki_external()
        .with_filter(january_2020())
        .with_split(SplitSpec::single("country", string_ref("country")))
        .with_apply(ApplySpec::new("avg_added", avg));
    let plan = get_query_and_post_transform(&external).unwrap();
    let doc = to_json(&plan.query);

    let names: Vec<&str> = field(&doc, "aggregations")
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["name"].as_str().unwrap())
        .collect();
    assert!(names.iter().all(|n| n.starts_with('!')));
    assert_eq!(plan.context.ignore_prefix.as_deref(), Some("!"));
    assert_eq!(field(&doc, "postAggregations.0.name"), "avg_added");

    // the intermediates never reach the datum
    let record = plan.post_transform.transform(&row(&[
        ("country", json!("UK")),
        ("!t_0", json!(30.0)),
        ("!t_1", json!(10)),
        ("avg_added", json!(3.0)),
    ]));
    match record {
        Record::Datum(datum) => {
            assert_eq!(datum.get("avg_added"), Some(&Value::Number(3.0)));
            assert!(datum.keys().all(|k| !k.starts_with('!')));
        }
        other => panic!("expected datum, got {:?}", other),
    }
}

#[test]
fn test_unsplitable_split_key_is_refused() {
    let external = wiki_external()
        .with_filter(january_2020())
        .with_split(SplitSpec::single(
            "users",
            Expr::reference("unique_users", ExprType::Null),
        ))
        .with_apply(ApplySpec::new("count", count()));
    let err = get_query_and_post_transform(&external).unwrap_err();
    assert!(err.to_string().contains("un-splitable"));
}
