use std::collections::HashMap;

use mastr_client::domain::Table;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum JoinError {
    #[error("join key '{0}' missing from the base table")]
    MissingBaseKey(String),
    #[error("join key '{0}' missing from the extension table")]
    MissingExtensionKey(String),
}

/// One extension table to attach to the base.
#[derive(Debug, Clone, Copy)]
pub struct JoinSpec<'a> {
    pub table: &'a Table,
    /// Column of the (partially joined) base holding the key.
    pub base_key: &'a str,
    /// Column of the extension holding the key; dropped from the output.
    pub ext_key: &'a str,
    /// Appended to extension columns whose name is already taken.
    pub suffix: &'a str,
}

fn unique_name(name: &str, suffix: &str, taken: &[String]) -> String {
    let mut out = name.to_string();
    while taken.iter().any(|t| *t == out) {
        out.push_str(suffix);
    }
    out
}

fn join_one(base: Table, spec: &JoinSpec<'_>) -> Result<Table, JoinError> {
    let base_idx = base
        .column_index(spec.base_key)
        .ok_or_else(|| JoinError::MissingBaseKey(spec.base_key.to_string()))?;
    let ext = spec.table;
    let ext_idx = ext
        .column_index(spec.ext_key)
        .ok_or_else(|| JoinError::MissingExtensionKey(spec.ext_key.to_string()))?;

    // Last row per key wins.
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(ext.rows.len());
    let mut duplicates = 0usize;
    for (i, row) in ext.rows.iter().enumerate() {
        let Some(key) = row.get(ext_idx).filter(|k| !k.is_empty()) else {
            continue;
        };
        if index.insert(key.as_str(), i).is_some() {
            duplicates += 1;
        }
    }
    if duplicates > 0 {
        tracing::warn!(key = spec.ext_key, duplicates, "duplicate extension keys, keeping the last row");
    }

    let kept: Vec<usize> = (0..ext.columns.len()).filter(|i| *i != ext_idx).collect();
    let mut columns = base.columns.clone();
    for &i in &kept {
        let name = unique_name(&ext.columns[i], spec.suffix, &columns);
        columns.push(name);
    }

    let mut matched = 0usize;
    let rows = base
        .rows
        .into_iter()
        .map(|mut row| {
            let hit = row
                .get(base_idx)
                .filter(|k| !k.is_empty())
                .and_then(|k| index.get(k.as_str()))
                .map(|&i| &ext.rows[i]);
            if hit.is_some() {
                matched += 1;
            }
            for &i in &kept {
                let value = hit.and_then(|r| r.get(i)).cloned().unwrap_or_default();
                row.push(value);
            }
            row
        })
        .collect::<Vec<_>>();

    tracing::debug!(key = spec.base_key, rows = rows.len(), matched, "joined extension");

    Ok(Table {
        columns,
        key: base.key,
        rows,
    })
}

/// Left-join `specs` onto `base` in order.
///
/// Every base row appears exactly once and in its original position; rows
/// without a match get empty extension cells. Inputs are not modified.
pub fn left_join(base: &Table, specs: &[JoinSpec<'_>]) -> Result<Table, JoinError> {
    let mut out = base.clone();
    for spec in specs {
        out = join_one(out, spec)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(columns: &[&str], key: &str, rows: &[&[&str]]) -> Table {
        let mut t = Table::new(columns.iter().map(|c| c.to_string()).collect(), key);
        t.rows = rows
            .iter()
            .map(|r| r.iter().map(|v| v.to_string()).collect())
            .collect();
        t
    }

    fn power_units() -> Table {
        table(
            &["EinheitMastrNummer", "EegMastrNummer", "Bundesland"],
            "EinheitMastrNummer",
            &[&["A", "EEG-A", "Bayern"], &["B", "", "Hessen"]],
        )
    }

    fn biomass() -> Table {
        table(
            &["EinheitMastrNummer", "Hauptbrennstoff", "Bundesland"],
            "EinheitMastrNummer",
            &[&["A", "Biogas", "BY"]],
        )
    }

    fn unit_spec(t: &Table) -> JoinSpec<'_> {
        JoinSpec {
            table: t,
            base_key: "EinheitMastrNummer",
            ext_key: "EinheitMastrNummer",
            suffix: "_w",
        }
    }

    #[test]
    fn unmatched_units_keep_empty_extension_fields() {
        let ext = biomass();
        let out = left_join(&power_units(), &[unit_spec(&ext)]).expect("join");

        assert_eq!(
            out.columns,
            vec!["EinheitMastrNummer", "EegMastrNummer", "Bundesland", "Hauptbrennstoff", "Bundesland_w"]
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out.rows[0], vec!["A", "EEG-A", "Bayern", "Biogas", "BY"]);
        assert_eq!(out.rows[1], vec!["B", "", "Hessen", "", ""]);
        assert_eq!(out.key, "EinheitMastrNummer");
    }

    #[test]
    fn every_base_key_appears_exactly_once() {
        let ext = table(
            &["EinheitMastrNummer", "Hauptbrennstoff"],
            "EinheitMastrNummer",
            &[&["B", "Holz"], &["A", "Biogas"], &["B", "Altholz"], &["Z", "Gas"]],
        );
        let out = left_join(&power_units(), &[unit_spec(&ext)]).expect("join");

        assert_eq!(out.column_values("EinheitMastrNummer"), vec!["A", "B"]);
        // last duplicate wins
        assert_eq!(out.value(1, "Hauptbrennstoff"), Some("Altholz"));
    }

    #[test]
    fn chained_eeg_join_uses_base_eeg_number() {
        let unit = biomass();
        let eeg = table(
            &["EegMastrNummer", "InstallierteLeistung", "Bundesland"],
            "EegMastrNummer",
            &[&["EEG-A", "500", "x"], &["", "999", "y"]],
        );
        let specs = [
            unit_spec(&unit),
            JoinSpec {
                table: &eeg,
                base_key: "EegMastrNummer",
                ext_key: "EegMastrNummer",
                suffix: "_e",
            },
        ];
        let out = left_join(&power_units(), &specs).expect("join");

        assert_eq!(out.value(0, "InstallierteLeistung"), Some("500"));
        // empty base key never matches the empty-key extension row
        assert_eq!(out.value(1, "InstallierteLeistung"), Some(""));
        assert_eq!(out.value(0, "Bundesland_e"), Some("x"));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn repeated_collisions_stack_suffixes() {
        let taken = vec!["Ort".to_string(), "Ort_e".to_string()];
        assert_eq!(unique_name("Ort", "_e", &taken), "Ort_e_e");
        assert_eq!(unique_name("Name", "_e", &taken), "Name");
    }

    #[test]
    fn inputs_are_left_untouched() {
        let base = power_units();
        let ext = biomass();
        let _ = left_join(&base, &[unit_spec(&ext)]).expect("join");
        assert_eq!(base, power_units());
        assert_eq!(ext, biomass());
    }

    #[test]
    fn missing_keys_are_errors() {
        let ext = biomass();
        let spec = JoinSpec {
            base_key: "Nope",
            ..unit_spec(&ext)
        };
        assert_eq!(
            left_join(&power_units(), &[spec]).unwrap_err(),
            JoinError::MissingBaseKey("Nope".to_string())
        );

        let spec = JoinSpec {
            ext_key: "Nope",
            ..unit_spec(&ext)
        };
        assert!(matches!(
            left_join(&power_units(), &[spec]),
            Err(JoinError::MissingExtensionKey(_))
        ));
    }
}
