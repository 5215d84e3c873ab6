use std::rc::Rc;

use oq_lang::{Engine, InnerError, MemoryModel, ModelKind, ObjectAccess, RuntimeError, Value};
use rstest::{fixture, rstest};

#[fixture]
fn model() -> Rc<MemoryModel> {
    Rc::new(MemoryModel::new())
}

fn num(n: f64) -> Value {
    Value::from(n)
}

fn eval(model: &Rc<MemoryModel>, code: &str) -> Result<Value, oq_lang::Error> {
    Engine::new(Rc::clone(model) as _).eval(code, &**model, None, vec![])
}

#[rstest]
#[case::arithmetic("1 + 2 * 3", num(7.0))]
#[case::precedence("(1 + 2) * 3", num(9.0))]
#[case::unary_minus("1 -3", num(-2.0))]
#[case::underscores("7_000_000 / 1_000", num(7000.0))]
#[case::exponent("100 == 1e2", Value::Bool(true))]
#[case::string_concat("'n = ' + 7", Value::from("n = 7"))]
#[case::null_concat("'a' + null", Value::from("a"))]
#[case::null_arith("1 + null", Value::Null)]
#[case::null_equals_empty_list("null == list()", Value::Bool(true))]
#[case::singleton_collapse("list('a') == 'a'", Value::Bool(true))]
#[case::or_asymmetry_a("toBoolean(null || false)", Value::Bool(false))]
#[case::or_asymmetry_b("(false || null) == null", Value::Bool(true))]
#[case::and_null("toBoolean(null && true)", Value::Bool(false))]
#[case::not_null("!null", Value::Bool(true))]
#[case::zero_is_truthy("0 ? 'y' : 'n'", Value::from("y"))]
#[case::broadcast("(list(5, 3, 2, 1) + 2).sum()", num(19.0))]
#[case::block("{ a = 1; b = a + 1; a + b }", num(3.0))]
#[case::currying("(a -> b -> a + b)(1)(2)", num(3.0))]
#[case::map_filter("list(1, 2, 3, 4).filter(x -> x % 2 == 0).map(x -> x * 10).sum()", num(60.0))]
#[case::reduce("list(1, 2, 3).reduce(a -> b -> a + b, 10)", num(16.0))]
#[case::sort_desc("list(2, 3, 1).sort(desc(x -> x)).first()", num(3.0))]
#[case::desc_self_cancelling("list(2, 3, 1).sort(desc(desc(x -> x))).first()", num(1.0))]
#[case::none_is_empty("list() == none()", Value::Bool(true))]
#[case::singleton_null("singleton(null).size()", num(0.0))]
#[case::sum_ignores_null("sum(3, 5, null)", num(8.0))]
#[case::average_empty("average() == null", Value::Bool(true))]
#[case::switch_selector(
    "switch (2) { 1: 'one'; 2: 'two'; default: 'unknown'; }",
    Value::from("two")
)]
#[case::switch_guards(
    "{ n = 100; switch { n < 10: 'small'; default: 'big'; } }",
    Value::from("big")
)]
#[case::bounded_recursion("0.recursion(x -> x + 1, 0, 5).size()", num(6.0))]
#[case::unbounded_recursion(
    "1.recursion(x -> x < 5 ? x * 2 : null) == list(1, 2, 4, 8)",
    Value::Bool(true)
)]
#[case::regex_replace_literal(
    "regex('a(b+)?c').regexReplace('xacyabbcz', '_$1_')",
    Value::from("x_y_bb_z")
)]
#[case::template("{{{<b>Hi {1 + 1}</b>}}}", Value::from("<b>Hi 2</b>"))]
#[case::struct_access("{'a': 1, 'b': 2}.get('b')", num(2.0))]
#[case::negative_index("list(1, 2, 3).get(-1)", num(3.0))]
#[case::substring("'abcdef'.subString(1, 3)", Value::from("bc"))]
#[case::group_by(
    "list('aa', 'b', 'cc').groupBy(s -> s.length()).get('2') == list('aa', 'cc')",
    Value::Bool(true)
)]
#[case::index_by(
    "list('aa', 'b', 'cc').indexBy(s -> s.length()).get('1')",
    Value::from("b")
)]
fn test_expression(model: Rc<MemoryModel>, #[case] code: &str, #[case] expected: Value) {
    assert_eq!(eval(&model, code).unwrap(), expected, "on `{code}`");
}

#[rstest]
fn test_reduce_without_initial_value(model: Rc<MemoryModel>) {
    let result = eval(&model, "list(1, 2, 3, 4).reduce(a -> b -> a + b)").unwrap();
    assert_eq!(result, num(10.0));
}

#[rstest]
fn test_model_roundtrip(model: Rc<MemoryModel>) {
    model.register("Shop:Item", ModelKind::Type);
    let item = model.create_object("Shop:Item");
    model.set_attr(&item, "name", Value::from("hat"));
    model.set_attr(&item, "price", num(12.0));

    let engine = Engine::new(Rc::clone(&model) as _);
    let result = engine
        .eval(
            "item -> item.get('name') + ': ' + item.get('price')",
            &*model,
            None,
            vec![Value::Model(item)],
        )
        .unwrap();
    assert_eq!(result, Value::from("hat: 12"));
}

#[rstest]
fn test_mutation_requires_transaction(model: Rc<MemoryModel>) {
    model.register("Shop:Item", ModelKind::Type);
    let item = model.create_object("Shop:Item");

    let engine = Engine::new(Rc::clone(&model) as _);
    let err = engine
        .eval(
            "item -> item.set('price', 1)",
            &*model,
            None,
            vec![Value::Model(item.clone())],
        )
        .unwrap_err();
    assert!(matches!(
        err.cause,
        InnerError::Eval(RuntimeError::Access { .. })
    ));

    model.begin_transaction();
    let result = engine
        .eval(
            "item -> item.set('price', 1)",
            &*model,
            None,
            vec![Value::Model(item.clone())],
        )
        .unwrap();
    model.end_transaction();
    assert_eq!(result, Value::Model(item.clone()));
    assert_eq!(model.get(&item, "price"), Ok(num(1.0)));
}

#[rstest]
fn test_template_writer_and_safety(model: Rc<MemoryModel>) {
    let engine = Engine::new(Rc::clone(&model) as _);
    let mut out = String::new();
    let result = engine
        .eval("{{{<i>{'x' + 1}</i>}}}", &*model, Some(&mut out), vec![])
        .unwrap();
    assert_eq!(result, Value::Null);
    assert_eq!(out, "<i>x1</i>");

    let err = engine
        .eval(
            r#"{{{<a href="{'java' + 'script:alert(1)'}">x</a>}}}"#,
            &*model,
            None,
            vec![],
        )
        .unwrap_err();
    assert!(matches!(
        err.cause,
        InnerError::Eval(RuntimeError::UnsafeOutput(_))
    ));
}

#[rstest]
fn test_syntax_error_position(model: Rc<MemoryModel>) {
    let err = eval(&model, "1 +\n* 2").unwrap_err();
    assert!(matches!(err.cause, InnerError::Parse(_)));
    assert_eq!(err.source_code, "1 +\n* 2");
}

#[rstest]
fn test_compile_once_run_many(model: Rc<MemoryModel>) {
    let engine = Engine::new(Rc::clone(&model) as _);
    let compiled = engine.compile("x -> x * x").unwrap();
    for i in 1..=3 {
        let result = compiled
            .execute_with(&*model, None, vec![num(i as f64)])
            .unwrap();
        assert_eq!(result, num((i * i) as f64));
    }
}
