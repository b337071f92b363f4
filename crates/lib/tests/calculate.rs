//! End-to-end compilation tests over a small salary/sex model fixture.

use calcsql_lib::layout::{
    CalculateLayout, CalculateMicroLayout, CalculateTableLayout, ColumnKind, FilterColumn,
    FilterOp, OrderByColumn, ReadLayout,
};
use calcsql_lib::meta::{
    AttrMeta, DimensionMeta, EntityGenMeta, EntityMeta, EnumItem, ModelMeta, ParamMeta,
    TableAccMeta, TableExprMeta, TableMeta, TypeKind, TypeMeta,
};
use calcsql_lib::{CalcError, calculate_microdata, calculate_output_table};
use pretty_assertions::assert_eq;

fn enum_type(name: &str, codes: &[&str]) -> TypeMeta {
    TypeMeta {
        name: name.to_owned(),
        kind: TypeKind::Enum,
        enums: codes
            .iter()
            .enumerate()
            .map(|(i, c)| EnumItem {
                enum_id: i as i32,
                name: (*c).to_owned(),
            })
            .collect(),
    }
}

fn model() -> ModelMeta {
    ModelMeta {
        name: "modelOne".to_owned(),
        tables: vec![TableMeta {
            table_hid: 101,
            name: "salarySex".to_owned(),
            db_expr_table: "salarySex_v_2012820".to_owned(),
            db_acc_table: "salarySex_a_2012820".to_owned(),
            dims: vec![
                DimensionMeta {
                    name: "Salary".to_owned(),
                    col_name: "dim0".to_owned(),
                    type_of: enum_type("salary", &["L", "M", "H"]),
                },
                DimensionMeta {
                    name: "Sex".to_owned(),
                    col_name: "dim1".to_owned(),
                    type_of: enum_type("sex", &["F", "M"]),
                },
            ],
            exprs: (0..4)
                .map(|id| TableExprMeta {
                    expr_id: id,
                    name: format!("Expr{id}"),
                })
                .collect(),
            accs: vec![
                TableAccMeta {
                    acc_id: 0,
                    name: "acc0".to_owned(),
                    is_derived: false,
                },
                TableAccMeta {
                    acc_id: 1,
                    name: "acc1".to_owned(),
                    is_derived: false,
                },
                TableAccMeta {
                    acc_id: 2,
                    name: "acc2".to_owned(),
                    is_derived: true,
                },
            ],
        }],
        entities: vec![EntityMeta {
            name: "Person".to_owned(),
            attrs: vec![
                AttrMeta {
                    attr_id: 0,
                    name: "AgeGroup".to_owned(),
                    col_name: "attr0".to_owned(),
                    type_of: enum_type("ageGroup", &["10-20", "20-30", "30-40", "40+"]),
                },
                AttrMeta {
                    attr_id: 1,
                    name: "Sex".to_owned(),
                    col_name: "attr1".to_owned(),
                    type_of: TypeMeta::bool_type(),
                },
                AttrMeta {
                    attr_id: 2,
                    name: "Income".to_owned(),
                    col_name: "attr2".to_owned(),
                    type_of: TypeMeta {
                        name: "double".to_owned(),
                        kind: TypeKind::Float,
                        enums: vec![],
                    },
                },
                AttrMeta {
                    attr_id: 3,
                    name: "Pension".to_owned(),
                    col_name: "attr3".to_owned(),
                    type_of: TypeMeta {
                        name: "double".to_owned(),
                        kind: TypeKind::Float,
                        enums: vec![],
                    },
                },
            ],
        }],
        entity_gens: vec![EntityGenMeta {
            entity_name: "Person".to_owned(),
            gen_hid: 201,
            gen_digest: "a1b2c3".to_owned(),
            db_gen_table: "Person_g_2012820".to_owned(),
            attr_names: vec!["AgeGroup".to_owned(), "Sex".to_owned(), "Income".to_owned()],
        }],
        params: vec![
            ParamMeta {
                param_hid: 103,
                name: "Scale".to_owned(),
                db_run_table: "Scale_p_2012_817".to_owned(),
                rank: 0,
                kind: TypeKind::Float,
            },
            ParamMeta {
                param_hid: 104,
                name: "BaseAges".to_owned(),
                db_run_table: "BaseAges_p_2012_818".to_owned(),
                rank: 1,
                kind: TypeKind::Int,
            },
        ],
    }
}

fn table_request(calcs: Vec<CalculateLayout>) -> CalculateTableLayout {
    CalculateTableLayout {
        layout: ReadLayout {
            name: "salarySex".to_owned(),
            from_id: 102,
            ..ReadLayout::default()
        },
        calculation: calcs,
    }
}

fn calc(formula: &str, calc_id: i32, is_aggr: bool) -> CalculateLayout {
    CalculateLayout {
        calculate: formula.to_owned(),
        calc_id,
        name: format!("calc_{calc_id}"),
        is_aggr,
    }
}

fn micro_request(calcs: Vec<CalculateLayout>) -> CalculateMicroLayout {
    CalculateMicroLayout {
        layout: ReadLayout {
            name: "Person".to_owned(),
            from_id: 102,
            ..ReadLayout::default()
        },
        gen_digest: "a1b2c3".to_owned(),
        group_by: vec!["AgeGroup".to_owned(), "Sex".to_owned()],
        calculation: calcs,
    }
}

const RUNS: [i32; 2] = [103, 104];

#[test]
fn single_expression_full_sql() {
    let out = calculate_output_table(&model(), &table_request(vec![calc("Expr0", 12000, false)]), &RUNS)
        .unwrap();
    assert_eq!(
        out.sql,
        "WITH cs0 (run_id, dim0, dim1, src0) AS \
         (SELECT BR.run_id, C.dim0, C.dim1, C.expr_value FROM salarySex_v_2012820 C \
         INNER JOIN run_table BR ON (BR.base_run_id = C.run_id AND BR.table_hid = 101) \
         WHERE C.expr_id = 0) \
         SELECT B.run_id, 12000 AS calc_id, B.dim0, B.dim1, B.src0 AS calc_value \
         FROM cs0 B WHERE B.run_id IN (102, 103, 104) ORDER BY 1, 2, 3, 4"
    );

    let shape: Vec<ColumnKind> = out.shape.columns.iter().map(|c| c.kind).collect();
    assert_eq!(
        shape,
        vec![
            ColumnKind::Int,
            ColumnKind::Int,
            ColumnKind::EnumId,
            ColumnKind::EnumId,
            ColumnKind::Double,
        ]
    );
    assert!(out.shape.columns.last().unwrap().nullable);
}

#[test]
fn two_expressions_join_by_run_and_dims() {
    let out = calculate_output_table(
        &model(),
        &table_request(vec![calc("Expr0 + Expr1", 12000, false)]),
        &RUNS,
    )
    .unwrap();

    assert!(out.sql.contains("cs0 (run_id, dim0, dim1, src0) AS"));
    assert!(out.sql.contains("cs1 (run_id, dim0, dim1, src1) AS"));
    assert!(out.sql.contains(
        "INNER JOIN cs1 B1 ON (B1.run_id = B.run_id AND B1.dim0 = B.dim0 AND B1.dim1 = B.dim1)"
    ));
    assert!(out.sql.contains("B.src0 + B1.src1 AS calc_value"));
    assert!(out.sql.contains("WHERE B.run_id IN (102, 103, 104)"));
}

#[test]
fn comparison_joins_variant_by_dims_only() {
    let out = calculate_output_table(
        &model(),
        &table_request(vec![calc("Expr0[variant] - Expr0[base]", 12000, false)]),
        &RUNS,
    )
    .unwrap();

    assert_eq!(out.sql.matches("cs0 (run_id").count(), 1);
    assert!(out.sql.contains(
        "SELECT V.run_id, 12000 AS calc_id, B.dim0, B.dim1, V.src0 - B.src0 AS calc_value \
         FROM cs0 B INNER JOIN cs0 V ON (V.dim0 = B.dim0 AND V.dim1 = B.dim1)"
    ));
    assert!(out.sql.contains("WHERE B.run_id = 102 AND V.run_id IN (103, 104)"));
}

#[test]
fn simple_functions_expand_to_case() {
    let out = calculate_output_table(
        &model(),
        &table_request(vec![calc("OM_SUM(acc0 * OM_DIV_BY(acc1))", 12000, true)]),
        &RUNS,
    )
    .unwrap();
    assert!(out.sql.contains(
        "CASE WHEN ABS(L1A1.acc_value) > 1.0e-37 THEN L1A1.acc_value ELSE NULL END"
    ));
}

#[test]
fn nested_aggregation_levels_share_source_cte() {
    let layout = table_request(vec![calc("OM_SUM(acc0 - 0.5 * OM_AVG(acc0))", 12000, true)]);
    let out = calculate_output_table(&model(), &layout, &RUNS).unwrap();

    assert!(out.sql.starts_with(
        "WITH asrc (run_id, acc_id, sub_id, dim0, dim1, acc_value) AS \
         (SELECT BR.run_id, C.acc_id, C.sub_id, C.dim0, C.dim1, C.acc_value \
         FROM salarySex_a_2012820 C \
         INNER JOIN run_table BR ON (BR.base_run_id = C.run_id AND BR.table_hid = 101))"
    ));
    assert_eq!(out.sql.matches("asrc (run_id").count(), 1);
    assert!(out.sql.contains("SUM(M1.acc_value - 0.5 * T2.ex1) AS calc_value"));
    assert!(out.sql.contains("AVG(M2.acc_value) AS ex1"));
    assert!(out.sql.contains(
        "WHERE M1.acc_id = 0 AND M1.run_id IN (102, 103, 104) \
         GROUP BY M1.run_id, M1.dim0, M1.dim1"
    ));

    // byte-identical on a second run
    let again = calculate_output_table(&model(), &layout, &RUNS).unwrap();
    assert_eq!(out.sql, again.sql);
}

#[test]
fn parameters_in_comparison_emit_base_and_variant_ctes() {
    let out = calculate_output_table(
        &model(),
        &table_request(vec![calc(
            "(Expr0[variant] - Expr0[base]) + (param.Scale[variant] - param.Scale[base])",
            12000,
            false,
        )]),
        &RUNS,
    )
    .unwrap();

    assert!(out.sql.contains("pbase_103 (param_base) AS"));
    assert!(out.sql.contains("pvar_103 (run_id, param_var) AS"));
    assert!(out.sql.contains("INNER JOIN pbase_103 PB103"));
    assert!(out.sql.contains("INNER JOIN pvar_103 PV103 ON (PV103.run_id = V.run_id)"));
    assert!(out.sql.contains(
        "(V.src0 - B.src0) + (PV103.param_var - PB103.param_base) AS calc_value"
    ));
}

#[test]
fn duplicate_calculations_collapse() {
    let out = calculate_output_table(
        &model(),
        &table_request(vec![
            calc("Expr0", 12000, false),
            calc("Expr0", 12000, false),
        ]),
        &RUNS,
    )
    .unwrap();
    assert!(!out.sql.contains("UNION ALL"));
    assert_eq!(out.sql.matches("cs0 (run_id").count(), 1);
}

#[test]
fn distinct_calculations_union_with_shared_ctes() {
    let out = calculate_output_table(
        &model(),
        &table_request(vec![
            calc("Expr0", 12000, false),
            calc("2 * Expr0", 12001, false),
        ]),
        &RUNS,
    )
    .unwrap();
    assert_eq!(out.sql.matches("UNION ALL").count(), 1);
    assert_eq!(out.sql.matches("cs0 (run_id").count(), 1);
    assert!(out.sql.contains("12000 AS calc_id"));
    assert!(out.sql.contains("12001 AS calc_id"));
}

#[test]
fn source_alias_avoids_expression_names() {
    let mut model = model();
    model.tables[0].exprs[1].name = "src0".to_owned();

    let out = calculate_output_table(
        &model,
        &table_request(vec![calc("Expr0 + src0", 12000, false)]),
        &RUNS,
    )
    .unwrap();
    assert!(out.sql.contains("cs0 (run_id, dim0, dim1, _src0) AS"));
    assert!(out.sql.contains("B._src0 + B1.src1 AS calc_value"));
}

#[test]
fn dimension_filter_and_explicit_order() {
    let mut layout = table_request(vec![calc("Expr0", 12000, false)]);
    layout.layout.filters = vec![FilterColumn {
        name: "Salary".to_owned(),
        op: FilterOp::InAuto,
        values: vec!["L".to_owned(), "M".to_owned()],
    }];
    layout.layout.order_by = vec![OrderByColumn {
        index: 3,
        desc: true,
    }];

    let out = calculate_output_table(&model(), &layout, &RUNS).unwrap();
    assert!(out.sql.contains("AND B.dim0 BETWEEN 0 AND 1"));
    assert!(out.sql.ends_with("ORDER BY 3 DESC"));
}

#[test]
fn value_filter_wraps_the_union() {
    let mut layout = table_request(vec![CalculateLayout {
        calculate: "Expr0".to_owned(),
        calc_id: 12000,
        name: "OutValue".to_owned(),
        is_aggr: false,
    }]);
    layout.layout.filters = vec![FilterColumn {
        name: "OutValue".to_owned(),
        op: FilterOp::Between,
        values: vec!["1.5".to_owned(), "9".to_owned()],
    }];

    let out = calculate_output_table(&model(), &layout, &RUNS).unwrap();
    assert!(out.sql.contains(", A (run_id, calc_id, dim0, dim1, calc_value) AS ("));
    assert!(out.sql.contains(
        "SELECT run_id, calc_id, dim0, dim1, calc_value FROM A \
         WHERE (A.calc_id = 12000 AND A.calc_value BETWEEN 1.5 AND 9) ORDER BY 1, 2, 3, 4"
    ));
}

#[test]
fn microdata_average_grouped_by_attributes() {
    let out = calculate_microdata(
        &model(),
        &micro_request(vec![calc("OM_AVG(Income)", 12001, true)]),
        &RUNS,
    )
    .unwrap();

    assert!(out.sql.starts_with(
        "WITH asrc (run_id, attr0, attr1, attr2) AS \
         (SELECT NR.run_id, C.attr0, C.attr1, C.attr2 FROM Person_g_2012820 C \
         INNER JOIN run_entity NR ON (NR.base_run_id = C.run_id AND NR.entity_gen_hid = 201))"
    ));
    assert!(out.sql.contains(
        "SELECT M1.run_id, 12001 AS calc_id, M1.attr0, M1.attr1, AVG(M1.attr2) AS calc_value \
         FROM asrc M1 WHERE M1.run_id IN (102, 103, 104) \
         GROUP BY M1.run_id, M1.attr0, M1.attr1"
    ));

    let kinds: Vec<ColumnKind> = out.shape.columns.iter().map(|c| c.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ColumnKind::Int,
            ColumnKind::Int,
            ColumnKind::EnumId,
            ColumnKind::Bool,
            ColumnKind::Double,
        ]
    );
}

#[test]
fn microdata_comparison_joins_base_by_entity_key() {
    let out = calculate_microdata(
        &model(),
        &micro_request(vec![calc("OM_AVG(Income[variant] - Income[base])", 12001, true)]),
        &RUNS,
    )
    .unwrap();

    assert!(out.sql.contains("asrc (run_id, entity_key, attr0, attr1, attr2) AS"));
    assert!(out.sql.contains(
        "INNER JOIN asrc B ON (B.run_id = 102 AND B.entity_key = M1.entity_key)"
    ));
    assert!(out.sql.contains("AVG(M1.attr2 - B.attr2) AS calc_value"));
    assert!(out.sql.contains("WHERE M1.run_id IN (103, 104)"));
}

#[test]
fn microdata_comparison_needs_variant_runs() {
    assert!(matches!(
        calculate_microdata(
            &model(),
            &micro_request(vec![calc("OM_AVG(Income[variant] - Income[base])", 12001, true)]),
            &[102],
        ),
        Err(CalcError::EmptyVariantList { .. })
    ));
}

#[test]
fn microdata_calculations_must_agree_on_comparison() {
    let err = calculate_microdata(
        &model(),
        &micro_request(vec![
            calc("OM_AVG(Income[variant] - Income[base])", 12001, true),
            calc("OM_AVG(Income)", 12002, true),
        ]),
        &RUNS,
    )
    .unwrap_err();
    assert!(matches!(err, CalcError::MixedCompareForms { .. }));
}

#[test]
fn group_by_must_be_enum_based() {
    let mut layout = micro_request(vec![calc("OM_AVG(Income)", 12001, true)]);
    layout.group_by = vec!["Income".to_owned()];
    assert!(matches!(
        calculate_microdata(&model(), &layout, &RUNS),
        Err(CalcError::BadGroupByType { .. })
    ));
}

#[test]
fn error_taxonomy() {
    let m = model();
    let run = |formula: &str, is_aggr: bool| {
        calculate_output_table(&m, &table_request(vec![calc(formula, 12000, is_aggr)]), &RUNS)
    };

    assert!(matches!(
        run("Expr0; DELETE", false),
        Err(CalcError::UnsafeSql { .. })
    ));
    assert!(matches!(
        run("Expr0 + Expr1[base]", false),
        Err(CalcError::MixedNameForms { .. })
    ));
    assert!(matches!(
        run("1 + 2", false),
        Err(CalcError::NoExpressionNames { .. })
    ));
    assert!(matches!(
        run("Expr0 + param.BaseAges", false),
        Err(CalcError::NonScalarParameter { .. })
    ));
    assert!(matches!(
        run("OM_SUM(acc0", true),
        Err(CalcError::MalformedCall { .. })
    ));

    let mut layout = table_request(vec![calc("Expr0", 12000, false)]);
    layout.layout.name = "noSuchTable".to_owned();
    assert!(matches!(
        calculate_output_table(&m, &layout, &RUNS),
        Err(CalcError::UnknownTable(_))
    ));

    let mut layout = table_request(vec![calc("Expr0", 12000, false)]);
    layout.layout.filters = vec![FilterColumn {
        name: "Area".to_owned(),
        op: FilterOp::Equal,
        values: vec!["X".to_owned()],
    }];
    assert!(matches!(
        calculate_output_table(&m, &layout, &RUNS),
        Err(CalcError::UnknownAttribute { .. })
    ));

    let mut layout = table_request(vec![calc("Expr0", 12000, false)]);
    layout.layout.filters = vec![FilterColumn {
        name: "Salary".to_owned(),
        op: FilterOp::Equal,
        values: vec!["XL".to_owned()],
    }];
    assert!(matches!(
        calculate_output_table(&m, &layout, &RUNS),
        Err(CalcError::EnumCodeUnknown { .. })
    ));

    // a [variant] parameter with no runs to compare against
    assert!(matches!(
        calculate_output_table(
            &m,
            &table_request(vec![calc(
                "(Expr0[variant] - Expr0[base]) + param.Scale[variant] + param.Scale[base]",
                12000,
                false,
            )]),
            &[102],
        ),
        Err(CalcError::EmptyVariantList { .. })
    ));

    // same without any parameter: only the base run is requested
    assert!(matches!(
        calculate_output_table(
            &m,
            &table_request(vec![calc("Expr0[variant] - Expr0[base]", 12000, false)]),
            &[102],
        ),
        Err(CalcError::EmptyVariantList { .. })
    ));
    assert!(matches!(
        calculate_output_table(
            &m,
            &table_request(vec![calc("OM_AVG(acc0[variant] - acc0[base])", 12000, true)]),
            &[102],
        ),
        Err(CalcError::EmptyVariantList { .. })
    ));
}

#[test]
fn quoted_keywords_are_not_unsafe() {
    let out = calculate_output_table(
        &model(),
        &table_request(vec![calc("OM_IF(Expr0 > 1 THEN Expr0 ELSE 'DROP')", 12000, false)]),
        &RUNS,
    )
    .unwrap();
    assert!(out.sql.contains("CASE WHEN B.src0 > 1 THEN B.src0 ELSE 'DROP' END AS calc_value"));
}
