//! Data source expansion: templates to concrete test units.
//!
//! Sources on the same parameter are additive, parameters combine as a
//! cartesian product, and class rows multiply method rows. A produced item
//! consumed by several parameters is unwrapped one tuple level per
//! consumption; an item consumed by a single parameter is passed whole.

use std::sync::Arc;

use serde_json::Value;

use crate::errors::DiscoveryError;
use crate::traits::DataProducer;
use crate::types::*;

/// A class prepared for expansion.
pub(crate) struct ClassContext {
    pub descriptor: Arc<ClassDescriptor>,
    pub decl: ClassDecl,
    /// Nearest class-ancestry affinity, else the assembly affinity.
    pub affinity: Option<String>,
    /// Expanded constructor rows.
    pub rows: Vec<Vec<Argument>>,
}

// ---------------------------------------------------------------------------
// Signatures
// ---------------------------------------------------------------------------

/// Expand one parameter list and its sources into argument rows.
pub async fn expand_signature(
    test: &str,
    signature: &DataSignature,
) -> Result<Vec<Vec<Argument>>, DiscoveryError> {
    let params = &signature.params;
    if !signature.rows.is_empty() && !signature.per_param.is_empty() {
        return Err(DiscoveryError::MixedSources {
            test: test.to_string(),
        });
    }

    let rows = if !signature.rows.is_empty() {
        let mut rows = Vec::new();
        for source in &signature.rows {
            match source {
                DataSource::Row(values) => rows.push(fit_row(test, values.clone(), params)?),
                DataSource::Values(items) => {
                    for item in items {
                        let values = unwrap_item(test, item.clone(), params)?;
                        rows.push(fit_row(test, values, params)?);
                    }
                }
                DataSource::Producer(producer) => {
                    for item in produce(test, producer.as_ref()).await? {
                        let values = unwrap_item(test, item, params)?;
                        rows.push(fit_row(test, values, params)?);
                    }
                }
                DataSource::Fixture(request) => {
                    rows.push(fixture_row(test, request, params)?);
                }
            }
        }
        rows
    } else if params.is_empty() {
        vec![Vec::new()]
    } else {
        cartesian(parameter_axes(test, signature).await?)
    };

    if rows.is_empty() && signature.require_data {
        return Err(DiscoveryError::EmptyDataSource {
            test: test.to_string(),
        });
    }
    Ok(rows)
}

/// One axis of alternatives per parameter.
async fn parameter_axes(
    test: &str,
    signature: &DataSignature,
) -> Result<Vec<Vec<Argument>>, DiscoveryError> {
    let params = &signature.params;
    let mut axes: Vec<Option<Vec<Argument>>> = vec![None; params.len()];

    for (name, source) in &signature.per_param {
        let index = params.iter().position(|p| &p.name == name).ok_or_else(|| {
            DiscoveryError::UnknownParameter {
                test: test.to_string(),
                param: name.clone(),
            }
        })?;
        let param = &params[index];
        let axis = axes[index].get_or_insert_with(Vec::new);
        match source {
            DataSource::Row(values) | DataSource::Values(values) => {
                for v in values {
                    axis.push(Argument::Value(check_shape(test, param, v.clone())?));
                }
            }
            DataSource::Producer(producer) => {
                for v in produce(test, producer.as_ref()).await? {
                    axis.push(Argument::Value(check_shape(test, param, v)?));
                }
            }
            DataSource::Fixture(request) => axis.push(Argument::Fixture(request.clone())),
        }
    }

    params
        .iter()
        .zip(axes)
        .map(|(param, axis)| match (axis, &param.default) {
            (Some(axis), _) => Ok(axis),
            (None, Some(default)) => Ok(vec![Argument::Value(default.clone())]),
            (None, None) => Err(DiscoveryError::MissingProducer {
                test: test.to_string(),
                param: param.name.clone(),
            }),
        })
        .collect()
}

/// Split a produced item across `params`.
pub(crate) fn unwrap_item(
    test: &str,
    item: Value,
    params: &[ParamSpec],
) -> Result<Vec<Value>, DiscoveryError> {
    let wanted = params.len();
    if wanted <= 1 {
        return Ok(vec![item]);
    }
    let mut current = item;
    loop {
        match current {
            Value::Array(items) if items.len() == wanted => return Ok(items),
            Value::Array(items) if items.len() == 1 && items[0].is_array() => {
                current = items.into_iter().next().unwrap_or(Value::Null);
            }
            Value::Array(items) if !items.is_empty() && items.len() < wanted => return Ok(items),
            other => {
                return Err(DiscoveryError::ArityMismatch {
                    test: test.to_string(),
                    expected: wanted,
                    found: other.as_array().map_or(1, Vec::len),
                });
            }
        }
    }
}

/// Match values to parameters, filling trailing defaults.
fn fit_row(
    test: &str,
    values: Vec<Value>,
    params: &[ParamSpec],
) -> Result<Vec<Argument>, DiscoveryError> {
    if values.len() > params.len() {
        return Err(DiscoveryError::ArityMismatch {
            test: test.to_string(),
            expected: params.len(),
            found: values.len(),
        });
    }
    let mut values = values.into_iter();
    params
        .iter()
        .map(|param| match values.next() {
            Some(v) => Ok(Argument::Value(check_shape(test, param, v)?)),
            None => default_for(test, param),
        })
        .collect()
}

fn fixture_row(
    test: &str,
    request: &FixtureRequest,
    params: &[ParamSpec],
) -> Result<Vec<Argument>, DiscoveryError> {
    let Some((_, rest)) = params.split_first() else {
        return Err(DiscoveryError::ArityMismatch {
            test: test.to_string(),
            expected: 0,
            found: 1,
        });
    };
    let mut row = vec![Argument::Fixture(request.clone())];
    for param in rest {
        row.push(default_for(test, param)?);
    }
    Ok(row)
}

fn default_for(test: &str, param: &ParamSpec) -> Result<Argument, DiscoveryError> {
    param
        .default
        .clone()
        .map(Argument::Value)
        .ok_or_else(|| DiscoveryError::MissingProducer {
            test: test.to_string(),
            param: param.name.clone(),
        })
}

fn check_shape(test: &str, param: &ParamSpec, value: Value) -> Result<Value, DiscoveryError> {
    if param.shape.matches(&value) {
        Ok(value)
    } else {
        Err(DiscoveryError::ShapeMismatch {
            test: test.to_string(),
            param: param.name.clone(),
        })
    }
}

async fn produce(test: &str, producer: &dyn DataProducer) -> Result<Vec<Value>, DiscoveryError> {
    producer
        .produce()
        .await
        .map_err(|e| DiscoveryError::Producer {
            test: test.to_string(),
            producer: producer.name().to_string(),
            message: e.to_string(),
        })
}

pub(crate) fn cartesian<T: Clone>(axes: Vec<Vec<T>>) -> Vec<Vec<T>> {
    axes.into_iter().fold(vec![Vec::new()], |acc, axis| {
        acc.iter()
            .flat_map(|prefix| {
                axis.iter().map(move |item| {
                    let mut row = prefix.clone();
                    row.push(item.clone());
                    row
                })
            })
            .collect()
    })
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Expand a template against its prepared class. `seq` is the plan-wide
/// registration counter.
pub(crate) async fn expand_template(
    template: &TestTemplate,
    class: &ClassContext,
    seq: &mut usize,
) -> Result<Vec<TestUnit>, DiscoveryError> {
    let base_id = format!("{}.{}", class.descriptor.name, template.method);
    let method_rows = expand_signature(&base_id, &template.signature).await?;
    let has_data = !template.signature.is_empty() || !class.decl.ctor.is_empty();

    let mut keys = class.decl.keys.clone();
    for key in &template.keys {
        keys.retain(|k| k.name != key.name);
        keys.push(key.clone());
    }
    let mut dependencies = class.decl.dependencies.clone();
    dependencies.extend(template.dependencies.iter().cloned());

    let mut units = Vec::with_capacity(class.rows.len() * method_rows.len());
    for (ci, class_row) in class.rows.iter().enumerate() {
        for (mi, method_row) in method_rows.iter().enumerate() {
            for repeat_index in 0..=template.repeat {
                let mut id = base_id.clone();
                if has_data {
                    id.push_str(&format!("[{ci}:{mi}]"));
                }
                if template.repeat > 0 {
                    id.push_str(&format!("#{repeat_index}"));
                }
                units.push(TestUnit {
                    id: UnitId::new(id),
                    seq: *seq,
                    class: Arc::clone(&class.descriptor),
                    method: template.method.clone(),
                    display_name: display_name(template, method_row),
                    class_args: class_row.clone(),
                    method_args: method_row.clone(),
                    dependencies: dependencies.clone(),
                    constraint_keys: keys.clone(),
                    group: template.group.clone().or_else(|| class.decl.group.clone()),
                    limit: template.limit.clone().or_else(|| class.decl.limit.clone()),
                    priority: template
                        .priority
                        .or(class.decl.priority)
                        .unwrap_or_default(),
                    retry: template
                        .retry
                        .clone()
                        .or_else(|| class.decl.retry.clone())
                        .unwrap_or_default(),
                    skip: template.skip.clone().or_else(|| class.decl.skip.clone()),
                    timeout: template.timeout.or(class.decl.timeout),
                    affinity: template.affinity.clone().or_else(|| class.affinity.clone()),
                    repeat_index,
                    categories: template.categories.clone(),
                    properties: template.properties.clone(),
                    instance: class.decl.instance.clone(),
                    body: Arc::clone(&template.body),
                    skip_when: template.skip_when.clone(),
                });
                *seq += 1;
            }
        }
    }
    Ok(units)
}

fn display_name(template: &TestTemplate, args: &[Argument]) -> String {
    let described: Vec<String> = args.iter().map(Argument::describe).collect();
    match &template.display_name {
        Some(custom) => described
            .iter()
            .enumerate()
            .fold(custom.clone(), |name, (i, arg)| {
                name.replace(&format!("{{{i}}}"), arg)
            }),
        None if described.is_empty() => template.method.clone(),
        None => format!("{}({})", template.method, described.join(", ")),
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::test_support::{Recorder, RecordingFactory};
    use crate::traits::{body_fn, producer_fn};

    fn values(args: &[Argument]) -> Vec<Value> {
        args.iter()
            .map(|a| a.as_value().cloned().unwrap_or(Value::Null))
            .collect()
    }

    fn sig(params: &[&str]) -> DataSignature {
        DataSignature {
            params: params.iter().map(|p| ParamSpec::new(*p)).collect(),
            ..DataSignature::default()
        }
    }

    #[test]
    fn sources_on_one_parameter_are_additive() {
        let mut s = sig(&["a"]);
        s.per_param.push(("a".into(), DataSource::values([json!(1), json!(2)])));
        s.per_param.push(("a".into(), DataSource::values([json!(3)])));
        let rows = block_on(expand_signature("T.m", &s)).unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn parameters_combine_multiplicatively() {
        let mut s = sig(&["a", "b"]);
        s.per_param.push(("a".into(), DataSource::values([json!(1), json!(2), json!(3)])));
        s.per_param.push((
            "b".into(),
            DataSource::producer(producer_fn("bs", || vec![json!("x"), json!("y")])),
        ));
        let rows = block_on(expand_signature("T.m", &s)).unwrap();
        assert_eq!(rows.len(), 6);
        assert_eq!(values(&rows[0]), vec![json!(1), json!("x")]);
        assert_eq!(values(&rows[5]), vec![json!(3), json!("y")]);
    }

    #[test]
    fn row_sources_are_additive() {
        let mut s = sig(&["a", "b"]);
        s.rows.push(DataSource::row([json!(1), json!(2)]));
        s.rows.push(DataSource::row([json!(3), json!(4)]));
        s.rows.push(DataSource::producer(producer_fn("more", || {
            vec![json!([5, 6]), json!([7, 8])]
        })));
        let rows = block_on(expand_signature("T.m", &s)).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(values(&rows[3]), vec![json!(7), json!(8)]);
    }

    #[test]
    fn nested_tuple_unwraps_once_across_parameters() {
        let mut s = DataSignature {
            params: vec![
                ParamSpec::new("value1"),
                ParamSpec::tuple("value2", vec![Shape::Scalar, Shape::Scalar]),
            ],
            ..DataSignature::default()
        };
        s.rows.push(DataSource::producer(producer_fn("nested", || {
            vec![json!([1, [2, 3]])]
        })));
        let rows = block_on(expand_signature("T.m", &s)).unwrap();
        assert_eq!(values(&rows[0]), vec![json!(1), json!([2, 3])]);
    }

    #[test]
    fn single_composite_parameter_is_not_unwrapped() {
        let mut s = DataSignature {
            params: vec![ParamSpec::tuple(
                "whole",
                vec![Shape::Scalar, Shape::Tuple(vec![Shape::Scalar, Shape::Scalar])],
            )],
            ..DataSignature::default()
        };
        s.rows.push(DataSource::producer(producer_fn("nested", || {
            vec![json!([1, [2, 3]])]
        })));
        let rows = block_on(expand_signature("T.m", &s)).unwrap();
        assert_eq!(values(&rows[0]), vec![json!([1, [2, 3]])]);
    }

    #[test]
    fn single_element_wrappers_are_peeled() {
        let params = vec![ParamSpec::new("a"), ParamSpec::new("b")];
        let values = unwrap_item("T.m", json!([[[1, 2]]]), &params).unwrap();
        assert_eq!(values, vec![json!(1), json!(2)]);
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let mut s = DataSignature {
            params: vec![
                ParamSpec::new("a"),
                ParamSpec::tuple("b", vec![Shape::Scalar, Shape::Scalar]),
            ],
            ..DataSignature::default()
        };
        s.rows.push(DataSource::row([json!(1), json!(2)]));
        let err = block_on(expand_signature("T.m", &s)).unwrap_err();
        assert!(matches!(err, DiscoveryError::ShapeMismatch { .. }));
    }

    #[test]
    fn missing_producer_fails_discovery() {
        let s = sig(&["a"]);
        let err = block_on(expand_signature("T.m", &s)).unwrap_err();
        assert_eq!(
            err,
            DiscoveryError::MissingProducer {
                test: "T.m".into(),
                param: "a".into()
            }
        );
    }

    #[test]
    fn defaults_fill_unbound_parameters() {
        let mut s = DataSignature {
            params: vec![
                ParamSpec::new("a"),
                ParamSpec::new("b").with_default(json!("dflt")),
            ],
            ..DataSignature::default()
        };
        s.per_param.push(("a".into(), DataSource::values([json!(1), json!(2)])));
        let rows = block_on(expand_signature("T.m", &s)).unwrap();
        assert_eq!(values(&rows[1]), vec![json!(2), json!("dflt")]);

        let mut short = sig(&["a"]);
        short.params.push(ParamSpec::new("b").with_default(json!(0)));
        short.rows.push(DataSource::row([json!(9)]));
        let rows = block_on(expand_signature("T.m", &short)).unwrap();
        assert_eq!(values(&rows[0]), vec![json!(9), json!(0)]);
    }

    #[test]
    fn empty_producer_yields_no_rows_unless_required() {
        let mut s = sig(&["a", "b"]);
        s.per_param.push(("a".into(), DataSource::values([json!(1)])));
        s.per_param.push(("b".into(), DataSource::producer(producer_fn("none", Vec::new))));
        assert!(block_on(expand_signature("T.m", &s)).unwrap().is_empty());

        s.require_data = true;
        let err = block_on(expand_signature("T.m", &s)).unwrap_err();
        assert!(matches!(err, DiscoveryError::EmptyDataSource { .. }));
    }

    #[test]
    fn mixed_sources_are_rejected() {
        let mut s = sig(&["a"]);
        s.rows.push(DataSource::row([json!(1)]));
        s.per_param.push(("a".into(), DataSource::values([json!(2)])));
        let err = block_on(expand_signature("T.m", &s)).unwrap_err();
        assert!(matches!(err, DiscoveryError::MixedSources { .. }));
    }

    #[test]
    fn unknown_parameter_is_rejected() {
        let mut s = sig(&["a"]);
        s.per_param.push(("zzz".into(), DataSource::values([json!(2)])));
        let err = block_on(expand_signature("T.m", &s)).unwrap_err();
        assert!(matches!(err, DiscoveryError::UnknownParameter { .. }));
    }

    #[test]
    fn fixture_source_fills_first_parameter() {
        let recorder = Recorder::default();
        let mut s = sig(&["db"]);
        s.rows.push(DataSource::fixture(
            RecordingFactory::new("db", recorder),
            SharingScope::PerTestClass,
        ));
        let rows = block_on(expand_signature("T.m", &s)).unwrap();
        assert!(matches!(rows[0][0], Argument::Fixture(_)));
    }

    fn class_ctx(rows: usize) -> ClassContext {
        let decl = ClassDecl::new("Calc")
            .param(ParamSpec::new("seed"))
            .not_in_parallel("db")
            .priority(Priority::High);
        ClassContext {
            descriptor: Arc::new(decl.descriptor.clone()),
            rows: (0..rows)
                .map(|i| vec![Argument::Value(json!(i))])
                .collect(),
            affinity: Some("ui".into()),
            decl,
        }
    }

    #[test]
    fn class_rows_multiply_method_rows() {
        let template = TestTemplate::new("Calc", "adds", body_fn(|_| async { Ok(()) }))
            .param(ParamSpec::new("x"))
            .param_source("x", DataSource::values([json!(1), json!(2), json!(3)]));
        let mut seq = 0;
        let units = block_on(expand_template(&template, &class_ctx(2), &mut seq)).unwrap();
        assert_eq!(units.len(), 6);
        assert_eq!(seq, 6);
        assert_eq!(units[0].id.as_str(), "Calc.adds[0:0]");
        assert_eq!(units[5].id.as_str(), "Calc.adds[1:2]");
        assert_eq!(units[4].display_name, "adds(2)");
        assert_eq!(units[0].priority, Priority::High);
        assert_eq!(units[0].constraint_keys, vec![ConstraintKey::new("db")]);
        assert_eq!(units[0].affinity.as_deref(), Some("ui"));
    }

    #[test]
    fn method_declarations_override_class_ones() {
        let template = TestTemplate::new("Calc", "ordered", body_fn(|_| async { Ok(()) }))
            .not_in_parallel_ordered("db", 2)
            .priority(Priority::Low)
            .affinity("worker");
        let mut seq = 10;
        let units = block_on(expand_template(&template, &class_ctx(1), &mut seq)).unwrap();
        assert_eq!(units[0].seq, 10);
        assert_eq!(units[0].constraint_keys, vec![ConstraintKey::ordered("db", 2)]);
        assert_eq!(units[0].priority, Priority::Low);
        assert_eq!(units[0].affinity.as_deref(), Some("worker"));
    }

    #[test]
    fn repeat_adds_copies_with_distinct_ids() {
        let template =
            TestTemplate::new("Calc", "flaky", body_fn(|_| async { Ok(()) })).repeat(2);
        let mut seq = 0;
        let units = block_on(expand_template(&template, &class_ctx(1), &mut seq)).unwrap();
        let ids: Vec<&str> = units.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["Calc.flaky[0:0]#0", "Calc.flaky[0:0]#1", "Calc.flaky[0:0]#2"]);
    }

    #[test]
    fn custom_display_name_substitutes_arguments() {
        let template = TestTemplate::new("Calc", "adds", body_fn(|_| async { Ok(()) }))
            .display_name("adding {0} and {1}")
            .param(ParamSpec::new("a"))
            .param(ParamSpec::new("b"))
            .source(DataSource::row([json!(1), json!("two")]));
        let mut seq = 0;
        let units = block_on(expand_template(&template, &class_ctx(1), &mut seq)).unwrap();
        assert_eq!(units[0].display_name, "adding 1 and \"two\"");
    }

    proptest! {
        #[test]
        fn cartesian_size_is_product_of_axes(sizes in proptest::collection::vec(0usize..4, 1..5)) {
            let axes: Vec<Vec<usize>> = sizes.iter().map(|n| (0..*n).collect()).collect();
            let rows = cartesian(axes);
            prop_assert_eq!(rows.len(), sizes.iter().product::<usize>());
            for row in &rows {
                prop_assert_eq!(row.len(), sizes.len());
            }
        }

        #[test]
        fn per_parameter_expansion_matches_product(sizes in proptest::collection::vec(1usize..4, 1..4)) {
            let mut s = DataSignature::default();
            for (i, n) in sizes.iter().enumerate() {
                let name = format!("p{i}");
                s.params.push(ParamSpec::new(name.clone()));
                s.per_param.push((name, DataSource::values((0..*n).map(|v| json!(v)))));
            }
            let rows = block_on(expand_signature("T.m", &s)).unwrap();
            prop_assert_eq!(rows.len(), sizes.iter().product::<usize>());
        }
    }
}
