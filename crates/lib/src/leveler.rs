//! Aggregation leveler: hoists nested `OM_*` aggregate calls into nested
//! GROUP BY sub-queries. Levels are kept as a flat vector; level `L` reads
//! the shared `asrc` CTE as `M<L>` and joins level `L+1` as `T<L+1>`.

use indexmap::IndexSet;
use itertools::Itertools;
use log::trace;

use crate::columns::{AggrCol, NameUse, ParamCols, Suffix};
use crate::params::param_ref;
use crate::resolver::{check_compare_forms, check_unresolved, replace_names, scan_names};
use calcsql_lib_core::errors::{CalcError, CalcResult};
use calcsql_lib_core::fnc::{AGGR_FNC_NAMES, find_first_fnc};

/// Name of the shared source CTE of the aggregation dialect.
pub const SRC_CTE: &str = "asrc";

/// One expression computed at a level: `calc_value` at level 1, synthesized
/// `ex<N>` columns below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelExpr {
    pub col_name: String,
    /// Source fragment, aggregate calls already templated.
    pub src: String,
    /// Final SQL after column and parameter substitution.
    pub sql: String,
}

/// One aggregation level.
#[derive(Debug, Clone, Default)]
pub struct LevelDef {
    /// 1-based; reads `asrc` as `M<level>`, is joined as `T<level>`.
    pub level: usize,
    pub exprs: Vec<LevelExpr>,
    /// Per aggregation column usage at this level.
    pub usage: Vec<NameUse>,
    /// First used aggregatable column, bare/`[variant]` side.
    pub anchor: Option<usize>,
    /// First used aggregatable column referenced as `[base]`.
    pub base_anchor: Option<usize>,
    /// Every reference at this level is `[base]`-suffixed; the level then
    /// reads base-run rows directly and its parent joins on dimensions only.
    pub base_only: bool,
    /// An aggregate call was translated at this level, so it groups rows.
    pub has_aggr: bool,
    pub acc_joins: IndexSet<String>,
    pub param_joins: IndexSet<String>,
}

impl LevelDef {
    fn new(level: usize) -> LevelDef {
        LevelDef {
            level,
            ..LevelDef::default()
        }
    }

    pub fn from_alias(&self) -> String {
        format!("M{}", self.level)
    }

    pub fn join_alias(&self) -> String {
        format!("T{}", self.level)
    }
}

/// Source shape of the aggregation dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggrSetup {
    /// Physical join/group columns: dimension columns for an output table,
    /// group-by attribute columns for microdata.
    pub dims: Vec<String>,
    /// Accumulator rows carry `acc_id`/`sub_id`; self-joins and the level
    /// WHERE filter on them. Microdata attributes live in one row instead,
    /// comparisons join on `entity_key`.
    pub by_acc_id: bool,
    pub from_id: i32,
}

/// Compiled aggregation formula: the level list and its comparison regime.
#[derive(Debug, Clone)]
pub struct AggrFormula {
    pub levels: Vec<LevelDef>,
    pub is_compare: bool,
}

/// Translate one aggregate call; `arg` has inner aggregates already replaced
/// by next-level references, `raw_arg` is the untouched argument pushed down
/// for the mean of the variance family.
fn translate_aggr_fnc(
    name: &str,
    arg: &str,
    raw_arg: &str,
    next_alias: &str,
    ex_count: &mut usize,
    pushed: &mut Vec<LevelExpr>,
    src: &str,
) -> CalcResult<String> {
    match name {
        "OM_AVG" => Ok(format!("AVG({arg})")),
        "OM_SUM" => Ok(format!("SUM({arg})")),
        "OM_COUNT" => Ok(format!("COUNT({arg})")),
        "OM_MIN" => Ok(format!("MIN({arg})")),
        "OM_MAX" => Ok(format!("MAX({arg})")),
        "OM_VAR" | "OM_SD" | "OM_SE" | "OM_CV" => {
            // variance needs the mean, computed one level down
            *ex_count += 1;
            let col = format!("ex{ex_count}");
            pushed.push(LevelExpr {
                col_name: col.clone(),
                src: format!("OM_AVG({raw_arg})"),
                sql: String::new(),
            });
            let avg = format!("{next_alias}.{col}");

            let var = format!(
                "SUM((({arg}) - {avg}) * (({arg}) - {avg})) / \
                 CASE WHEN ABS(COUNT({arg}) - 1) > 1e-37 THEN COUNT({arg}) - 1 ELSE NULL END"
            );
            Ok(match name {
                "OM_VAR" => var,
                "OM_SD" => format!("SQRT( {var} )"),
                "OM_SE" => format!(
                    "SQRT( {var} / \
                     CASE WHEN ABS(COUNT({arg})) > 1e-37 THEN COUNT({arg}) ELSE NULL END )"
                ),
                _ => format!(
                    "100 * ( SQRT({var}) / \
                     CASE WHEN ABS({avg}) > 1e-37 THEN {avg} ELSE NULL END )"
                ),
            })
        }
        _ => Err(CalcError::UnknownFunction {
            name: name.to_owned(),
            src: src.to_owned(),
        }),
    }
}

/// Hoist nested aggregates level by level until none remain.
fn build_levels(formula: &str) -> CalcResult<Vec<LevelDef>> {
    let mut levels = vec![LevelDef::new(1)];
    levels[0].exprs.push(LevelExpr {
        col_name: "calc_value".to_owned(),
        src: formula.to_owned(),
        sql: String::new(),
    });

    let mut ex_count = 0usize;
    let mut li = 0;

    while li < levels.len() {
        let next_alias = format!("T{}", li + 2);
        let mut pushed: Vec<LevelExpr> = Vec::new();

        for ei in 0..levels[li].exprs.len() {
            let mut src = levels[li].exprs[ei].src.clone();

            while let Some(call) = find_first_fnc(&src, &AGGR_FNC_NAMES)? {
                levels[li].has_aggr = true;

                let raw_arg = call.arg(&src).trim().to_owned();
                if raw_arg.is_empty() {
                    return Err(CalcError::EmptyArgument {
                        name: call.name.to_owned(),
                        src,
                    });
                }

                // push inner aggregates one level down
                let mut arg = raw_arg.clone();
                while let Some(inner) = find_first_fnc(&arg, &AGGR_FNC_NAMES)? {
                    ex_count += 1;
                    let col = format!("ex{ex_count}");
                    pushed.push(LevelExpr {
                        col_name: col.clone(),
                        src: arg[inner.name_pos..=inner.close_pos].to_owned(),
                        sql: String::new(),
                    });
                    arg = format!(
                        "{}{next_alias}.{col}{}",
                        &arg[..inner.name_pos],
                        &arg[inner.close_pos + 1..]
                    );
                }

                let replacement = translate_aggr_fnc(
                    call.name,
                    &arg,
                    &raw_arg,
                    &next_alias,
                    &mut ex_count,
                    &mut pushed,
                    &src,
                )?;
                src = format!(
                    "{}{}{}",
                    &src[..call.name_pos],
                    replacement,
                    &src[call.close_pos + 1..]
                );
            }
            levels[li].exprs[ei].src = src;
        }

        if !pushed.is_empty() {
            let mut next = LevelDef::new(li + 2);
            next.exprs = pushed;
            next.has_aggr = true;
            levels.push(next);
        }
        li += 1;
    }
    Ok(levels)
}

/// Anchor state of one level, copied out for the replacement pass.
#[derive(Debug, Clone, Copy)]
struct LevelAnchors {
    level: usize,
    anchor: Option<usize>,
    base_anchor: Option<usize>,
    base_only: bool,
}

/// Render one aggregation column reference at one level, recording the
/// self-join it needs.
fn render_col(
    at: LevelAnchors,
    setup: &AggrSetup,
    cols: &[AggrCol],
    k: usize,
    suffix: Suffix,
    acc_joins: &mut IndexSet<String>,
) -> String {
    let m = format!("M{}", at.level);
    let col = &cols[k];

    if !setup.by_acc_id {
        // microdata: all attributes live in the same row
        return match suffix {
            Suffix::None | Suffix::Variant => format!("{m}.{}", col.col_name),
            Suffix::Base if at.base_only => format!("{m}.{}", col.col_name),
            Suffix::Base => {
                acc_joins.insert(format!(
                    "INNER JOIN {SRC_CTE} B ON (B.run_id = {} AND B.entity_key = {m}.entity_key)",
                    setup.from_id
                ));
                format!("B.{}", col.col_name)
            }
        };
    }

    // accumulator rows: one alias per acc_id, anchored column reads M<L>
    let self_join = |alias: &str, run_cond: String| {
        let mut on = vec![run_cond];
        on.extend(setup.dims.iter().map(|d| format!("{alias}.{d} = {m}.{d}")));
        on.push(format!("{alias}.sub_id = {m}.sub_id"));
        on.push(format!("{alias}.acc_id = {}", col.acc_id));
        format!(
            "INNER JOIN {SRC_CTE} {alias} ON ({})",
            on.into_iter().join(" AND ")
        )
    };

    match suffix {
        Suffix::None | Suffix::Variant if at.anchor == Some(k) => {
            format!("{m}.{}", col.col_name)
        }
        Suffix::None | Suffix::Variant => {
            let alias = format!("L{}A{}", at.level, col.acc_id);
            acc_joins.insert(self_join(&alias, format!("{alias}.run_id = {m}.run_id")));
            format!("{alias}.{}", col.col_name)
        }
        Suffix::Base if at.base_only && at.base_anchor == Some(k) => {
            format!("{m}.{}", col.col_name)
        }
        Suffix::Base => {
            let alias = if at.base_anchor == Some(k) {
                "B".to_owned()
            } else {
                format!("B{}", col.acc_id)
            };
            acc_joins.insert(self_join(&alias, format!("{alias}.run_id = {}", setup.from_id)));
            format!("{alias}.{}", col.col_name)
        }
    }
}

/// Translate one aggregation formula into its level list. `formula` must be
/// sanitized with simple functions already rewritten; `kind` names the
/// source column family for error messages.
pub fn translate_aggr(
    formula: &str,
    setup: &AggrSetup,
    cols: &mut [AggrCol],
    params: &mut ParamCols,
    kind: &str,
) -> CalcResult<AggrFormula> {
    let mut levels = build_levels(formula)?;

    let mut names: Vec<String> = cols.iter().map(|c| c.name.clone()).collect();
    names.extend(params.keys().cloned().sorted());

    // usage detection, per level and formula-wide
    for lv in &mut levels {
        lv.usage = vec![NameUse::default(); cols.len()];
        for ei in 0..lv.exprs.len() {
            let usage = &mut lv.usage;
            scan_names(&lv.exprs[ei].src, &names, |idx, suffix| {
                if idx < cols.len() {
                    usage[idx].record(suffix);
                    cols[idx].used.record(suffix);
                } else if let Some(p) = params.get_mut(&names[idx]) {
                    p.used.record(suffix);
                }
            })?;
        }
    }

    let is_compare = check_compare_forms(
        cols.iter().map(|c| (c.name.as_str(), c.used)),
        params,
        kind,
        formula,
    )?;

    // anchor selection and the replacement pass
    for lv in &mut levels {
        lv.anchor = (0..cols.len())
            .find(|&k| cols[k].is_aggr && (lv.usage[k].is_simple || lv.usage[k].is_var));
        lv.base_anchor = (0..cols.len()).find(|&k| cols[k].is_aggr && lv.usage[k].is_base);
        lv.base_only = lv.anchor.is_none() && lv.base_anchor.is_some();

        let at = LevelAnchors {
            level: lv.level,
            anchor: lv.anchor,
            base_anchor: lv.base_anchor,
            base_only: lv.base_only,
        };
        let m = lv.from_alias();
        let acc_joins = &mut lv.acc_joins;
        let param_joins = &mut lv.param_joins;

        for expr in &mut lv.exprs {
            let sql = replace_names(&expr.src, &names, |idx, suffix| {
                if idx < cols.len() {
                    Ok(render_col(at, setup, cols, idx, suffix, acc_joins))
                } else {
                    let p = params
                        .get_mut(&names[idx])
                        .expect("scanned name is present");
                    let (col_ref, join) = param_ref(p, suffix, &m, &m, formula)?;
                    param_joins.insert(join);
                    Ok(col_ref)
                }
            })?;
            check_unresolved(&sql)?;
            expr.sql = sql;
        }
        trace!(
            "level {}: {}",
            lv.level,
            lv.exprs.iter().map(|e| &e.sql).join("; ")
        );
    }

    Ok(AggrFormula { levels, is_compare })
}

/// Emit the `FROM … [joins] [WHERE …] [GROUP BY …]` tail of level `li`,
/// nesting all deeper levels. `level_where` carries the run and dimension
/// filters of the outermost level.
pub fn emit_level_tail(
    levels: &[LevelDef],
    li: usize,
    setup: &AggrSetup,
    cols: &[AggrCol],
    level_where: &[String],
) -> String {
    let lv = &levels[li];
    let m = lv.from_alias();

    let mut sql = format!(" FROM {SRC_CTE} {m}");
    for join in &lv.acc_joins {
        sql.push(' ');
        sql.push_str(join);
    }

    if li + 1 < levels.len() {
        let child = &levels[li + 1];
        let t = child.join_alias();
        let cm = child.from_alias();

        let mut select = format!("SELECT {cm}.run_id");
        for d in &setup.dims {
            select.push_str(&format!(", {cm}.{d}"));
        }
        for e in &child.exprs {
            select.push_str(&format!(", {} AS {}", e.sql, e.col_name));
        }

        let mut on: Vec<String> = Vec::new();
        if !child.base_only {
            on.push(format!("{t}.run_id = {m}.run_id"));
        }
        on.extend(setup.dims.iter().map(|d| format!("{t}.{d} = {m}.{d}")));
        let on = if on.is_empty() {
            "1 = 1".to_owned()
        } else {
            on.into_iter().join(" AND ")
        };

        let tail = emit_level_tail(levels, li + 1, setup, cols, &[]);
        sql.push_str(&format!(" INNER JOIN ({select}{tail}) {t} ON ({on})"));
    }

    for join in &lv.param_joins {
        sql.push(' ');
        sql.push_str(join);
    }

    let mut conds: Vec<String> = Vec::new();
    if setup.by_acc_id
        && let Some(k) = if lv.base_only { lv.base_anchor } else { lv.anchor }
    {
        conds.push(format!("{m}.acc_id = {}", cols[k].acc_id));
    }
    if lv.base_only {
        conds.push(format!("{m}.run_id = {}", setup.from_id));
    }
    conds.extend(level_where.iter().cloned());
    if !conds.is_empty() {
        sql.push_str(&format!(" WHERE {}", conds.into_iter().join(" AND ")));
    }

    if lv.has_aggr {
        sql.push_str(&format!(" GROUP BY {m}.run_id"));
        for d in &setup.dims {
            sql.push_str(&format!(", {m}.{d}"));
        }
    }
    sql
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::columns::ParamCol;

    fn acc_cols() -> Vec<AggrCol> {
        let acc = |acc_id: i32, name: &str, is_aggr: bool| AggrCol {
            name: name.to_owned(),
            col_name: "acc_value".to_owned(),
            acc_id,
            is_aggr,
            is_group: false,
            used: NameUse::default(),
        };
        vec![
            acc(0, "acc0", true),
            acc(1, "acc1", true),
            acc(2, "acc2", false),
        ]
    }

    fn setup() -> AggrSetup {
        AggrSetup {
            dims: vec!["dim0".to_owned(), "dim1".to_owned()],
            by_acc_id: true,
            from_id: 102,
        }
    }

    fn translate(formula: &str) -> CalcResult<(AggrFormula, Vec<AggrCol>)> {
        let mut cols = acc_cols();
        let mut params = ParamCols::default();
        params.insert(
            "param.Scale".to_owned(),
            ParamCol {
                name: "Scale".to_owned(),
                param_hid: 103,
                db_run_table: "Scale_p".to_owned(),
                is_number: true,
                used: NameUse::default(),
            },
        );
        let out = translate_aggr(formula, &setup(), &mut cols, &mut params, "accumulators")?;
        Ok((out, cols))
    }

    #[test]
    fn nested_average_pushed_one_level_down() {
        let (out, _) = translate("OM_SUM(acc0 - 0.5 * OM_AVG(acc0))").unwrap();

        assert!(!out.is_compare);
        assert_eq!(out.levels.len(), 2);
        assert_eq!(
            out.levels[0].exprs[0].sql,
            "SUM(M1.acc_value - 0.5 * T2.ex1)"
        );
        assert_eq!(out.levels[1].exprs[0].col_name, "ex1");
        assert_eq!(out.levels[1].exprs[0].sql, "AVG(M2.acc_value)");
    }

    #[test]
    fn secondary_accumulator_self_joins() {
        let (out, _) = translate("OM_SUM(acc0 + acc1)").unwrap();

        assert_eq!(out.levels[0].exprs[0].sql, "SUM(M1.acc_value + L1A1.acc_value)");
        assert_eq!(
            out.levels[0].acc_joins.iter().collect::<Vec<_>>(),
            vec![
                "INNER JOIN asrc L1A1 ON (L1A1.run_id = M1.run_id AND L1A1.dim0 = M1.dim0 \
                 AND L1A1.dim1 = M1.dim1 AND L1A1.sub_id = M1.sub_id AND L1A1.acc_id = 1)"
            ]
        );
    }

    #[test]
    fn derived_accumulator_never_anchors() {
        let (out, _) = translate("OM_SUM(acc2)").unwrap();

        assert_eq!(out.levels[0].anchor, None);
        assert_eq!(out.levels[0].exprs[0].sql, "SUM(L1A2.acc_value)");
    }

    #[test]
    fn variance_family_pushes_the_mean() {
        let (out, _) = translate("OM_VAR(acc0)").unwrap();

        assert_eq!(out.levels.len(), 2);
        assert_eq!(
            out.levels[0].exprs[0].sql,
            "SUM(((M1.acc_value) - T2.ex1) * ((M1.acc_value) - T2.ex1)) / \
             CASE WHEN ABS(COUNT(M1.acc_value) - 1) > 1e-37 \
             THEN COUNT(M1.acc_value) - 1 ELSE NULL END"
        );
        assert_eq!(out.levels[1].exprs[0].sql, "AVG(M2.acc_value)");
    }

    #[test]
    fn parameter_joins_recorded_per_level() {
        let (out, _) = translate("OM_AVG(acc0 * param.Scale)").unwrap();

        assert_eq!(out.levels[0].exprs[0].sql, "AVG(M1.acc_value * BP103.param_value)");
        assert_eq!(
            out.levels[0].param_joins.iter().collect::<Vec<_>>(),
            vec!["INNER JOIN par_103 BP103 ON (BP103.run_id = M1.run_id)"]
        );
    }

    #[test]
    fn comparison_joins_base_rows() {
        let (out, _) = translate("OM_AVG(acc0[variant] - acc0[base])").unwrap();

        assert!(out.is_compare);
        assert_eq!(out.levels[0].exprs[0].sql, "AVG(M1.acc_value - B.acc_value)");
        assert_eq!(
            out.levels[0].acc_joins.iter().collect::<Vec<_>>(),
            vec![
                "INNER JOIN asrc B ON (B.run_id = 102 AND B.dim0 = M1.dim0 \
                 AND B.dim1 = M1.dim1 AND B.sub_id = M1.sub_id AND B.acc_id = 0)"
            ]
        );
    }

    #[test]
    fn base_only_inner_level_reads_base_rows() {
        let (out, _) = translate("OM_SUM(acc0[variant] - OM_AVG(acc0[base]))").unwrap();

        assert!(out.levels[1].base_only);
        assert_eq!(out.levels[1].exprs[0].sql, "AVG(M2.acc_value)");

        let tail = emit_level_tail(&out.levels, 0, &setup(), &acc_cols(), &[]);
        // the base-only sub-aggregate is joined on dimensions, not run id
        assert!(tail.contains(") T2 ON (T2.dim0 = M1.dim0 AND T2.dim1 = M1.dim1)"));
        assert!(tail.contains("WHERE M2.acc_id = 0 AND M2.run_id = 102 GROUP BY"));
    }

    #[test]
    fn one_sided_suffix_is_rejected() {
        assert!(matches!(
            translate("OM_SUM(acc0[base])"),
            Err(CalcError::MixedNameForms { .. })
        ));
    }

    #[test]
    fn no_accumulator_reference_is_rejected() {
        assert!(matches!(
            translate("OM_SUM(param.Scale)"),
            Err(CalcError::NoExpressionNames { .. })
        ));
    }

    #[test]
    fn scenario_tail_shape() {
        let (out, cols) = translate("OM_SUM(acc0 - 0.5 * OM_AVG(acc0))").unwrap();
        let tail = emit_level_tail(
            &out.levels,
            0,
            &setup(),
            &cols,
            &["M1.run_id IN (102, 103)".to_owned()],
        );
        assert_eq!(
            tail,
            " FROM asrc M1 INNER JOIN (SELECT M2.run_id, M2.dim0, M2.dim1, \
             AVG(M2.acc_value) AS ex1 FROM asrc M2 WHERE M2.acc_id = 0 \
             GROUP BY M2.run_id, M2.dim0, M2.dim1) T2 \
             ON (T2.run_id = M1.run_id AND T2.dim0 = M1.dim0 AND T2.dim1 = M1.dim1) \
             WHERE M1.acc_id = 0 AND M1.run_id IN (102, 103) \
             GROUP BY M1.run_id, M1.dim0, M1.dim1"
        );
    }
}
