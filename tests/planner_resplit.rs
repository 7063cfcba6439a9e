//! Integration tests for the nested group-by (re-split) rewrite

mod common;

use common::{
    count, day_bucket, field, january_2020, main_ref, number_ref, string_ref, to_json,
    wiki_external,
};
use quarry::{
    get_query_and_post_transform, ApplySpec, Expr, ExprType, PlanError, SplitKey, SplitSpec,
};
use serde_json::json;

/// `max( split($page).apply('x', count()) )`
fn max_count_per_page() -> Expr {
    resplit_max(None)
}

fn resplit_max(filter: Option<Expr>) -> Expr {
    let base = match filter {
        Some(predicate) => Expr::Filter {
            operand: Box::new(main_ref()),
            predicate: Box::new(predicate),
        },
        None => main_ref(),
    };
    Expr::Max {
        operand: Box::new(Expr::Apply {
            operand: Box::new(Expr::Split {
                operand: Box::new(base),
                keys: vec![SplitKey::new("page", string_ref("page"))],
                data_name: "inner".to_string(),
            }),
            name: "x".to_string(),
            expression: Box::new(Expr::Count {
                operand: Box::new(Expr::reference("inner", ExprType::Dataset)),
            }),
        }),
        expression: Box::new(number_ref("x")),
    }
}

#[test]
fn test_resplit_emits_nested_group_by() {
    let external = wiki_external()
        .with_filter(january_2020())
        .with_split(SplitSpec::single("day", day_bucket()))
        .with_apply(ApplySpec::new("max_per_page", max_count_per_page()));
    let plan = get_query_and_post_transform(&external).unwrap();
    let doc = to_json(&plan.query);

    // the outer query wraps the inner one as its data source
    assert_eq!(field(&doc, "queryType"), "groupBy");
    assert_eq!(field(&doc, "dataSource.type"), "query");
    assert_eq!(field(&doc, "dataSource.query.queryType"), "groupBy");

    // the outer query runs over all of time; the inner carries the filter
    assert_eq!(field(&doc, "intervals"), &json!(["1000/3000"]));
    assert_eq!(
        field(&doc, "dataSource.query.intervals"),
        &json!(["2020-01-01T00:00:00Z/2020-02-01T00:00:00Z"])
    );

    // inner splits by page and the day bucket, computing the intermediate
    let inner_dims = field(&doc, "dataSource.query.dimensions")
        .as_array()
        .unwrap();
    assert_eq!(inner_dims.len(), 2);
    assert_eq!(
        field(&doc, "dataSource.query.aggregations.0"),
        &json!({"type": "count", "name": "x_0"})
    );

    // inner query carries no sort and no limit
    assert!(field(&doc, "dataSource.query").get("limitSpec").is_none());

    // the outer aggregate recombines the intermediate
    assert_eq!(
        field(&doc, "aggregations.0"),
        &json!({"type": "longMax", "name": "max_per_page", "fieldName": "x_0"})
    );

    // the outer split reapplies the day bucket on the intermediate column
    assert_eq!(field(&doc, "dimensions.0.outputName"), "day");
}

#[test]
fn test_resplit_with_filtered_inner_split() {
    let filter = Expr::Is {
        operand: Box::new(string_ref("country")),
        value: Box::new(Expr::Literal(quarry::Value::String("UK".to_string()))),
    };
    let external = wiki_external()
        .with_filter(january_2020())
        .with_split(SplitSpec::single("day", day_bucket()))
        .with_apply(ApplySpec::new("max_uk", resplit_max(Some(filter))));
    let plan = get_query_and_post_transform(&external).unwrap();
    let doc = to_json(&plan.query);

    // the inner query computes both the filtered intermediate and its
    // defined-bucket counter
    let inner_aggs = field(&doc, "dataSource.query.aggregations")
        .as_array()
        .unwrap();
    let names: Vec<&str> = inner_aggs
        .iter()
        .map(|a| {
            a.get("name")
                .or_else(|| a.pointer("/aggregator/name"))
                .and_then(|n| n.as_str())
                .unwrap()
        })
        .collect();
    assert!(names.contains(&"x_0"));
    assert!(names.contains(&"x_0_def"));

    // the outer aggregate skips buckets the filter never matched
    assert_eq!(field(&doc, "aggregations.0.type"), "filtered");
    assert_eq!(
        field(&doc, "aggregations.0.aggregator"),
        &json!({"type": "longMax", "name": "max_uk", "fieldName": "x_0"})
    );
}

#[test]
fn test_plain_aggregates_pull_through() {
    let external = wiki_external()
        .with_filter(january_2020())
        .with_split(SplitSpec::single("day", day_bucket()))
        .with_apply(ApplySpec::new("max_per_page", max_count_per_page()))
        .with_apply(ApplySpec::new("total", count()));
    let plan = get_query_and_post_transform(&external).unwrap();
    let doc = to_json(&plan.query);

    // the row count evaluates per inner bucket and recombines as a sum
    let inner_aggs = field(&doc, "dataSource.query.aggregations")
        .as_array()
        .unwrap();
    assert!(inner_aggs
        .iter()
        .any(|a| a["type"] == "count" && a["name"] == "total_1"));
    assert_eq!(
        field(&doc, "aggregations.1"),
        &json!({"type": "longSum", "name": "total", "fieldName": "total_1"})
    );
}

#[test]
fn test_total_mode_resplit_plans_zero_dimension_outer() {
    let external = wiki_external()
        .with_filter(january_2020())
        .with_apply(ApplySpec::new("max_per_page", max_count_per_page()));
    let plan = get_query_and_post_transform(&external).unwrap();
    let doc = to_json(&plan.query);

    // the outer query aggregates over every inner bucket, grouping by nothing
    assert_eq!(field(&doc, "queryType"), "groupBy");
    assert_eq!(field(&doc, "dimensions"), &json!([]));
    assert_eq!(field(&doc, "intervals"), &json!(["1000/3000"]));
    assert_eq!(field(&doc, "dataSource.type"), "query");
    assert_eq!(field(&doc, "dataSource.query.queryType"), "groupBy");

    // the inner query still splits by page under the original filter
    assert_eq!(
        field(&doc, "dataSource.query.dimensions.0.dimension"),
        "page"
    );
    assert_eq!(
        field(&doc, "dataSource.query.intervals"),
        &json!(["2020-01-01T00:00:00Z/2020-02-01T00:00:00Z"])
    );
    assert_eq!(
        field(&doc, "aggregations.0"),
        &json!({"type": "longMax", "name": "max_per_page", "fieldName": "x_0"})
    );
}

#[test]
fn test_value_mode_resplit_plans_nested_group_by() {
    let external = wiki_external()
        .with_filter(january_2020())
        .with_value_expression(max_count_per_page());
    let plan = get_query_and_post_transform(&external).unwrap();
    let doc = to_json(&plan.query);

    assert_eq!(field(&doc, "queryType"), "groupBy");
    assert_eq!(field(&doc, "dimensions"), &json!([]));
    assert_eq!(field(&doc, "dataSource.type"), "query");
    assert_eq!(
        field(&doc, "aggregations.0"),
        &json!({"type": "longMax", "name": "__VALUE__", "fieldName": "x_0"})
    );

    // the transform still yields a single value
    let row: quarry::Row = [("__VALUE__".to_string(), json!(7))].into_iter().collect();
    assert_eq!(
        plan.post_transform.transform(&row),
        quarry::Record::Value(quarry::Value::Number(7.0))
    );
}

#[test]
fn test_resplit_aggregates_must_share_the_split() {
    let other_split = Expr::Max {
        operand: Box::new(Expr::Apply {
            operand: Box::new(Expr::Split {
                operand: Box::new(main_ref()),
                keys: vec![SplitKey::new("country", string_ref("country"))],
                data_name: "inner".to_string(),
            }),
            name: "y".to_string(),
            expression: Box::new(Expr::Count {
                operand: Box::new(Expr::reference("inner", ExprType::Dataset)),
            }),
        }),
        expression: Box::new(number_ref("y")),
    };
    let external = wiki_external()
        .with_filter(january_2020())
        .with_split(SplitSpec::single("day", day_bucket()))
        .with_apply(ApplySpec::new("a", max_count_per_page()))
        .with_apply(ApplySpec::new("b", other_split));
    let err = get_query_and_post_transform(&external).unwrap_err();
    assert!(matches!(err, PlanError::InvalidConfiguration(_)));
    assert!(err
        .to_string()
        .contains("all resplit aggregators must have the same split"));
}

#[test]
fn test_custom_aggregate_with_resplit_is_rejected() {
    let external = wiki_external()
        .with_filter(january_2020())
        .with_split(SplitSpec::single("day", day_bucket()))
        .with_custom_aggregation("theta", json!({"type": "thetaSketch", "fieldName": "t"}))
        .with_apply(ApplySpec::new("max_per_page", max_count_per_page()))
        .with_apply(ApplySpec::new(
            "uniques",
            Expr::CustomAggregate {
                operand: Box::new(main_ref()),
                name: "theta".to_string(),
            },
        ));
    assert!(matches!(
        get_query_and_post_transform(&external),
        Err(PlanError::Unsupported(_))
    ));
}
