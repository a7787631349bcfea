//! FILENAME: engine/src/aggregation/simple.rs
//! PURPOSE: Simple statistics over the resolved source values.
//! CONTEXT: Source values are flattened first, so a whole multi-field column
//! contributes each of its elements. Numeric statistics only look at values
//! that coerce to numbers; blank handling decides whether blanks become 0.

use super::spec::{BlankHandling, SimpleStatistic};
use crate::numeric::{embedded_numbers, mean, median, mode, numbers, sum};
use crate::value::DataValue;
use regex::{Regex, RegexBuilder};

/// Reduces `values` with `statistic`.
pub fn reduce(statistic: &SimpleStatistic, values: &[DataValue], blanks: BlankHandling) -> DataValue {
    let items: Vec<DataValue> = values.iter().flat_map(DataValue::flatten).collect();

    match statistic {
        SimpleStatistic::Sum => DataValue::Number(sum(&numeric(&items, blanks))),
        SimpleStatistic::Average => number_or_blank(mean(&numeric(&items, blanks))),
        SimpleStatistic::Median => number_or_blank(median(&numeric(&items, blanks))),
        SimpleStatistic::SumAggressive => DataValue::Number(sum(&aggressive(&items, blanks))),
        SimpleStatistic::AverageAggressive => number_or_blank(mean(&aggressive(&items, blanks))),
        SimpleStatistic::HighestAverage { n } => number_or_blank(mean(&extreme(&items, blanks, *n, true))),
        SimpleStatistic::LowestAverage { n } => number_or_blank(mean(&extreme(&items, blanks, *n, false))),
        SimpleStatistic::HighestSum { n } => DataValue::Number(sum(&extreme(&items, blanks, *n, true))),
        SimpleStatistic::LowestSum { n } => DataValue::Number(sum(&extreme(&items, blanks, *n, false))),
        SimpleStatistic::Mode => mode(&texts(&items))
            .map(DataValue::Text)
            .unwrap_or_default(),
        SimpleStatistic::Count => count(numeric(&items, blanks).len()),
        SimpleStatistic::CountNonEmpty => count(items.iter().filter(|v| !v.is_blank()).count()),
        SimpleStatistic::CountBlank => count(items.iter().filter(|v| v.is_blank()).count()),
        SimpleStatistic::CountIf { value } => {
            count(items.iter().filter(|v| v.to_text() == *value).count())
        }
        SimpleStatistic::CountIfStartsWith { prefix } => {
            count(items.iter().filter(|v| v.to_text().starts_with(prefix.as_str())).count())
        }
        SimpleStatistic::CountIfContains { needle } => {
            let needle = needle.to_lowercase();
            count(
                items
                    .iter()
                    .filter(|v| v.to_text().to_lowercase().contains(&needle))
                    .count(),
            )
        }
        SimpleStatistic::CountIfMatchesRegex { pattern } => match case_insensitive(pattern) {
            Some(re) => count(items.iter().filter(|v| re.is_match(&v.to_text())).count()),
            None => DataValue::Empty,
        },
        SimpleStatistic::CountAllRegexMatches { pattern } => match case_insensitive(pattern) {
            Some(re) => count(items.iter().map(|v| re.find_iter(&v.to_text()).count()).sum()),
            None => DataValue::Empty,
        },
        SimpleStatistic::Clone => values.first().cloned().unwrap_or_default(),
        SimpleStatistic::Concatenate { separator } => DataValue::Text(texts(&items).join(separator)),
    }
}

fn count(n: usize) -> DataValue {
    DataValue::Number(n as f64)
}

fn number_or_blank(n: Option<f64>) -> DataValue {
    n.map(DataValue::Number).unwrap_or_default()
}

/// Non-blank values as text.
fn texts(items: &[DataValue]) -> Vec<String> {
    items
        .iter()
        .filter(|v| !v.is_blank())
        .map(DataValue::to_text)
        .collect()
}

fn with_blanks(items: &[DataValue], blanks: BlankHandling) -> Vec<DataValue> {
    items
        .iter()
        .map(|v| match blanks {
            BlankHandling::TreatAsZero if v.is_blank() => DataValue::Number(0.0),
            _ => v.clone(),
        })
        .collect()
}

fn numeric(items: &[DataValue], blanks: BlankHandling) -> Vec<f64> {
    numbers(&with_blanks(items, blanks))
}

/// Numbers, falling back to the first number embedded in text.
fn aggressive(items: &[DataValue], blanks: BlankHandling) -> Vec<f64> {
    with_blanks(items, blanks)
        .iter()
        .filter_map(|v| {
            v.as_number()
                .or_else(|| embedded_numbers(&v.to_text()).first().copied())
        })
        .collect()
}

/// The `n` highest (or lowest) numbers.
fn extreme(items: &[DataValue], blanks: BlankHandling, n: usize, highest: bool) -> Vec<f64> {
    let mut values = numeric(items, blanks);
    if highest {
        values.sort_by(|a, b| b.total_cmp(a));
    } else {
        values.sort_by(f64::total_cmp);
    }
    values.truncate(n);
    values
}

fn case_insensitive(pattern: &str) -> Option<Regex> {
    match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(re) => Some(re),
        Err(err) => {
            log_warn!("AGGREGATE", "invalid statistic pattern '{}': {}", pattern, err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(items: &[&str]) -> Vec<DataValue> {
        items.iter().map(|s| DataValue::text(*s)).collect()
    }

    fn run(statistic: SimpleStatistic, items: &[&str]) -> DataValue {
        reduce(&statistic, &values(items), BlankHandling::Leave)
    }

    #[test]
    fn average_excludes_blanks_unless_zeroed() {
        let vals = vec![DataValue::Number(4.0), DataValue::Empty];
        assert_eq!(
            reduce(&SimpleStatistic::Average, &vals, BlankHandling::Leave),
            DataValue::Number(4.0)
        );
        assert_eq!(
            reduce(&SimpleStatistic::Average, &vals, BlankHandling::TreatAsZero),
            DataValue::Number(2.0)
        );
        assert_eq!(run(SimpleStatistic::Average, &["", "x"]), DataValue::Empty);
        assert_eq!(run(SimpleStatistic::Sum, &[]), DataValue::Number(0.0));
    }

    #[test]
    fn lists_are_flattened() {
        let vals = vec![DataValue::from(vec!["1", "2"]), DataValue::text("3")];
        assert_eq!(
            reduce(&SimpleStatistic::Sum, &vals, BlankHandling::Leave),
            DataValue::Number(6.0)
        );
        assert_eq!(
            reduce(&SimpleStatistic::Median, &vals, BlankHandling::Leave),
            DataValue::Number(2.0)
        );
    }

    #[test]
    fn aggressive_reads_numbers_inside_text() {
        assert_eq!(
            run(SimpleStatistic::SumAggressive, &["7 marks", "about 2.5", "none"]),
            DataValue::Number(9.5)
        );
        assert_eq!(
            run(SimpleStatistic::AverageAggressive, &["score: 4 of 5", "6"]),
            DataValue::Number(5.0)
        );
    }

    #[test]
    fn counting_statistics() {
        let items = ["Yes", "yes", "", "No", "3"];
        assert_eq!(run(SimpleStatistic::Count, &items), DataValue::Number(1.0));
        assert_eq!(run(SimpleStatistic::CountNonEmpty, &items), DataValue::Number(4.0));
        assert_eq!(run(SimpleStatistic::CountBlank, &items), DataValue::Number(1.0));
        assert_eq!(
            run(SimpleStatistic::CountIf { value: "Yes".to_string() }, &items),
            DataValue::Number(1.0)
        );
        assert_eq!(
            run(SimpleStatistic::CountIfStartsWith { prefix: "Y".to_string() }, &items),
            DataValue::Number(1.0)
        );
        assert_eq!(
            run(SimpleStatistic::CountIfContains { needle: "ES".to_string() }, &items),
            DataValue::Number(2.0)
        );
        assert_eq!(
            run(SimpleStatistic::CountIfMatchesRegex { pattern: "^y".to_string() }, &items),
            DataValue::Number(2.0)
        );
        assert_eq!(
            run(SimpleStatistic::CountAllRegexMatches { pattern: "o".to_string() }, &["foo", "NO"]),
            DataValue::Number(3.0)
        );
    }

    #[test]
    fn top_and_bottom_n() {
        let items = ["5", "1", "9", "7"];
        assert_eq!(run(SimpleStatistic::HighestAverage { n: 2 }, &items), DataValue::Number(8.0));
        assert_eq!(run(SimpleStatistic::LowestSum { n: 2 }, &items), DataValue::Number(6.0));
        assert_eq!(run(SimpleStatistic::HighestSum { n: 10 }, &items), DataValue::Number(22.0));
    }

    #[test]
    fn text_statistics() {
        assert_eq!(
            run(SimpleStatistic::Mode, &["b", "a", "b", ""]),
            DataValue::text("b")
        );
        assert_eq!(
            run(SimpleStatistic::Concatenate { separator: ", ".to_string() }, &["a", "", "c"]),
            DataValue::text("a, c")
        );
        assert_eq!(run(SimpleStatistic::Clone, &["first", "second"]), DataValue::text("first"));
    }
}
