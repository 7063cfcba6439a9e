//! Integration tests for shape selection
//!
//! One test per native query shape, checking both the emitted document and
//! the post-transform's handling of literal response rows.

mod common;

use common::{
    count, day_bucket, field, instant, january_2020, main_ref, string_ref, sum_of, time_ref,
    to_json, wiki_external,
};
use quarry::{
    get_query_and_post_transform, ApplySpec, Direction, Expr, Mode, PlanError, Record,
    SplitSpec, Value,
};
use serde_json::json;

fn row(pairs: &[(&str, serde_json::Value)]) -> quarry::Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// -- timeBoundary -------------------------------------------------------------

#[test]
fn test_total_of_max_time_becomes_time_boundary() {
    let external = wiki_external()
        .with_mode(Mode::Total)
        .with_apply(ApplySpec::new(
            "max",
            Expr::Max {
                operand: Box::new(main_ref()),
                expression: Box::new(time_ref()),
            },
        ));
    let plan = get_query_and_post_transform(&external).unwrap();
    assert_eq!(
        to_json(&plan.query),
        json!({"queryType": "timeBoundary", "dataSource": "wiki", "bound": "maxTime"})
    );

    let record = plan
        .post_transform
        .transform(&row(&[("maxTime", json!("2020-01-02T00:00:00Z"))]));
    match record {
        Record::Datum(datum) => {
            assert_eq!(
                datum.get("max"),
                Some(&Value::Time(instant("2020-01-02T00:00:00Z")))
            );
        }
        other => panic!("expected datum, got {:?}", other),
    }
}

#[test]
fn test_mixed_min_max_time_boundary_is_unbounded() {
    let external = wiki_external()
        .with_mode(Mode::Total)
        .with_apply(ApplySpec::new(
            "min",
            Expr::Min {
                operand: Box::new(main_ref()),
                expression: Box::new(time_ref()),
            },
        ))
        .with_apply(ApplySpec::new(
            "max",
            Expr::Max {
                operand: Box::new(main_ref()),
                expression: Box::new(time_ref()),
            },
        ));
    let plan = get_query_and_post_transform(&external).unwrap();
    let doc = to_json(&plan.query);
    assert_eq!(field(&doc, "queryType"), "timeBoundary");
    assert!(doc.get("bound").is_none());
}

#[test]
fn test_value_of_min_time_becomes_time_boundary() {
    let external = wiki_external().with_value_expression(Expr::Min {
        operand: Box::new(main_ref()),
        expression: Box::new(time_ref()),
    });
    let plan = get_query_and_post_transform(&external).unwrap();
    assert_eq!(field(&to_json(&plan.query), "bound"), "minTime");

    let record = plan
        .post_transform
        .transform(&row(&[("minTime", json!("2019-06-01T00:00:00Z"))]));
    assert_eq!(
        record,
        Record::Value(Value::Time(instant("2019-06-01T00:00:00Z")))
    );
}

// -- timeseries ---------------------------------------------------------------

#[test]
fn test_day_split_becomes_timeseries() {
    let external = wiki_external()
        .with_filter(january_2020())
        .with_split(SplitSpec::single("day", day_bucket()))
        .with_apply(ApplySpec::new("count", count()))
        .with_sort("day", Direction::Ascending);
    let plan = get_query_and_post_transform(&external).unwrap();
    let doc = to_json(&plan.query);

    assert_eq!(field(&doc, "queryType"), "timeseries");
    assert_eq!(
        field(&doc, "granularity"),
        &json!({"type": "period", "period": "P1D", "timeZone": "Etc/UTC"})
    );
    assert_eq!(field(&doc, "context.skipEmptyBuckets"), "true");
    assert_eq!(
        field(&doc, "intervals"),
        &json!(["2020-01-01T00:00:00Z/2020-02-01T00:00:00Z"])
    );
    assert_eq!(plan.context.timestamp.as_deref(), Some("day"));

    // bucket timestamps come back under the split key name
    let record = plan.post_transform.transform(&row(&[
        ("timestamp", json!("2020-01-05T00:00:00Z")),
        ("count", json!(120)),
    ]));
    match record {
        Record::Datum(datum) => {
            assert_eq!(
                datum.get("day"),
                Some(&Value::Time(instant("2020-01-05T00:00:00Z")))
            );
            assert_eq!(datum.get("count"), Some(&Value::Number(120.0)));
        }
        other => panic!("expected datum, got {:?}", other),
    }
}

#[test]
fn test_descending_time_sort_sets_descending() {
    let external = wiki_external()
        .with_filter(january_2020())
        .with_split(SplitSpec::single("day", day_bucket()))
        .with_apply(ApplySpec::new("count", count()))
        .with_sort("day", Direction::Descending);
    let plan = get_query_and_post_transform(&external).unwrap();
    assert_eq!(field(&to_json(&plan.query), "descending"), &json!(true));
}

#[test]
fn test_limit_within_timeseries_is_rejected() {
    let external = wiki_external()
        .with_filter(january_2020())
        .with_split(SplitSpec::single("day", day_bucket()))
        .with_apply(ApplySpec::new("count", count()))
        .with_sort("day", Direction::Ascending)
        .with_limit(5);
    assert!(matches!(
        get_query_and_post_transform(&external),
        Err(PlanError::Unsupported(_))
    ));
}

#[test]
fn test_caller_context_wins_over_skip_empty_buckets() {
    let external = wiki_external()
        .with_filter(january_2020())
        .with_split(SplitSpec::single("day", day_bucket()))
        .with_apply(ApplySpec::new("count", count()))
        .with_context("skipEmptyBuckets", json!("false"));
    let plan = get_query_and_post_transform(&external).unwrap();
    assert_eq!(field(&to_json(&plan.query), "context.skipEmptyBuckets"), "false");
}

// -- topN ---------------------------------------------------------------------

#[test]
fn test_sorted_limited_split_becomes_top_n() {
    let external = wiki_external()
        .with_filter(january_2020())
        .with_split(SplitSpec::single("country", string_ref("country")))
        .with_apply(ApplySpec::new("revenue", sum_of("added")))
        .with_sort("revenue", Direction::Descending)
        .with_limit(50);
    let plan = get_query_and_post_transform(&external).unwrap();
    let doc = to_json(&plan.query);

    assert_eq!(field(&doc, "queryType"), "topN");
    assert_eq!(
        field(&doc, "dimension"),
        &json!({"type": "default", "dimension": "country", "outputName": "country"})
    );
    assert_eq!(field(&doc, "metric"), "revenue");
    assert_eq!(field(&doc, "threshold"), &json!(50));
}

#[test]
fn test_ascending_aggregate_sort_inverts_metric() {
    let external = wiki_external()
        .with_filter(january_2020())
        .with_split(SplitSpec::single("country", string_ref("country")))
        .with_apply(ApplySpec::new("revenue", sum_of("added")))
        .with_sort("revenue", Direction::Ascending)
        .with_limit(10);
    let plan = get_query_and_post_transform(&external).unwrap();
    assert_eq!(
        field(&to_json(&plan.query), "metric"),
        &json!({"type": "inverted", "metric": "revenue"})
    );
}

#[test]
fn test_threshold_defaults_when_bucket_count_is_bounded() {
    let external = wiki_external()
        .with_filter(january_2020())
        .with_split(SplitSpec::single(
            "hour",
            Expr::TimePart {
                operand: Box::new(time_ref()),
                part: quarry::TimePartUnit::HourOfDay,
                time_zone: "Etc/UTC".to_string(),
            },
        ))
        .with_apply(ApplySpec::new("count", count()))
        .with_sort("count", Direction::Descending);
    let plan = get_query_and_post_transform(&external).unwrap();
    let doc = to_json(&plan.query);
    assert_eq!(field(&doc, "queryType"), "topN");
    assert_eq!(field(&doc, "threshold"), &json!(1000));
}

#[test]
fn test_exact_results_only_forbids_top_n() {
    let external = wiki_external()
        .with_filter(january_2020())
        .with_split(SplitSpec::single("country", string_ref("country")))
        .with_apply(ApplySpec::new("revenue", sum_of("added")))
        .with_sort("revenue", Direction::Descending)
        .with_limit(50)
        .with_exact_results_only(true);
    let plan = get_query_and_post_transform(&external).unwrap();
    assert_eq!(field(&to_json(&plan.query), "queryType"), "groupBy");
}

#[test]
fn test_time_filtered_sort_apply_is_not_top_n_compatible() {
    let filtered_by_time = Expr::Sum {
        operand: Box::new(Expr::Filter {
            operand: Box::new(main_ref()),
            predicate: Box::new(Expr::Compare {
                op: quarry::CompareOp::Greater,
                left: Box::new(time_ref()),
                right: Box::new(Expr::Literal(Value::Time(instant(
                    "2020-01-15T00:00:00Z",
                )))),
            }),
        }),
        expression: Box::new(common::number_ref("added")),
    };
    let external = wiki_external()
        .with_filter(january_2020())
        .with_split(SplitSpec::single("country", string_ref("country")))
        .with_apply(ApplySpec::new("late_added", filtered_by_time))
        .with_sort("late_added", Direction::Descending)
        .with_limit(10);
    let plan = get_query_and_post_transform(&external).unwrap();
    assert_eq!(field(&to_json(&plan.query), "queryType"), "groupBy");
}

// -- scan ---------------------------------------------------------------------

#[test]
fn test_raw_mode_with_time_order() {
    let external = wiki_external()
        .with_mode(Mode::Raw)
        .with_filter(january_2020())
        .with_allow_select_queries(true)
        .with_select(vec![
            "time".to_string(),
            "country".to_string(),
            "added".to_string(),
        ])
        .with_sort("time", Direction::Ascending)
        .with_limit(100);
    let plan = get_query_and_post_transform(&external).unwrap();
    let doc = to_json(&plan.query);

    assert_eq!(field(&doc, "queryType"), "scan");
    assert_eq!(field(&doc, "resultFormat"), "compactedList");
    assert_eq!(field(&doc, "order"), "ascending");
    assert_eq!(field(&doc, "limit"), &json!(100));
    let columns = field(&doc, "columns").as_array().unwrap();
    assert!(columns.contains(&json!("__time")));
    // the renamed time column rides on a virtual column
    assert_eq!(
        field(&doc, "virtualColumns.0"),
        &json!({"type": "expression", "name": "time", "expression": "__time", "outputType": "STRING"})
    );
}

#[test]
fn test_raw_mode_requires_select_capability() {
    let external = wiki_external()
        .with_mode(Mode::Raw)
        .with_filter(january_2020());
    assert!(matches!(
        get_query_and_post_transform(&external),
        Err(PlanError::InvalidConfiguration(_))
    ));
}

// -- value and total ----------------------------------------------------------

#[test]
fn test_value_mode_timeseries() {
    let external = wiki_external()
        .with_filter(january_2020())
        .with_value_expression(count());
    let plan = get_query_and_post_transform(&external).unwrap();
    let doc = to_json(&plan.query);

    assert_eq!(field(&doc, "queryType"), "timeseries");
    assert_eq!(field(&doc, "granularity"), "all");
    assert_eq!(
        field(&doc, "aggregations.0"),
        &json!({"type": "count", "name": "__VALUE__"})
    );

    let record = plan
        .post_transform
        .transform(&row(&[("__VALUE__", json!(42))]));
    assert_eq!(record, Record::Value(Value::Number(42.0)));
}

#[test]
fn test_filter_without_time_needs_eternity() {
    let external = wiki_external()
        .with_mode(Mode::Total)
        .with_apply(ApplySpec::new("count", count()))
        .with_filter(Expr::Is {
            operand: Box::new(string_ref("country")),
            value: Box::new(Expr::Literal(Value::String("UK".to_string()))),
        });
    assert!(matches!(
        get_query_and_post_transform(&external),
        Err(PlanError::InvalidConfiguration(_))
    ));

    let allowed = wiki_external()
        .with_mode(Mode::Total)
        .with_apply(ApplySpec::new("count", count()))
        .with_filter(Expr::Is {
            operand: Box::new(string_ref("country")),
            value: Box::new(Expr::Literal(Value::String("UK".to_string()))),
        })
        .with_allow_eternity(true);
    let plan = get_query_and_post_transform(&allowed).unwrap();
    assert_eq!(
        field(&to_json(&plan.query), "intervals"),
        &json!(["1000/3000"])
    );
}

// -- streaming ----------------------------------------------------------------

#[test]
fn test_record_stream_preserves_order_and_errors() {
    use futures::executor::block_on_stream;
    use futures::stream::{self, StreamExt};

    let external = wiki_external()
        .with_filter(january_2020())
        .with_value_expression(count());
    let plan = get_query_and_post_transform(&external).unwrap();

    let rows: Vec<Result<quarry::Row, quarry::RequestError>> = vec![
        Ok(row(&[("__VALUE__", json!(1))])),
        Err(quarry::RequestError::Transport("boom".to_string())),
        Ok(row(&[("__VALUE__", json!(2))])),
    ];
    let records: Vec<_> =
        block_on_stream(plan.post_transform.record_stream(stream::iter(rows).boxed())).collect();

    assert_eq!(records.len(), 3);
    assert!(matches!(&records[0], Ok(Record::Value(Value::Number(n))) if *n == 1.0));
    assert!(records[1].is_err());
    assert!(matches!(&records[2], Ok(Record::Value(Value::Number(n))) if *n == 2.0));
}

// -- determinism --------------------------------------------------------------

#[test]
fn test_planning_is_deterministic() {
    let external = wiki_external()
        .with_filter(january_2020())
        .with_split(SplitSpec::single("country", string_ref("country")))
        .with_apply(ApplySpec::new("count", count()))
        .with_apply(ApplySpec::new("revenue", sum_of("added")))
        .with_sort("revenue", Direction::Descending)
        .with_limit(5);
    let first = get_query_and_post_transform(&external).unwrap();
    let second = get_query_and_post_transform(&external).unwrap();
    assert_eq!(to_json(&first.query), to_json(&second.query));
    assert_eq!(first.post_transform, second.post_transform);
}
