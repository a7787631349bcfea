//! FILENAME: engine/src/formatter.rs
//! PURPOSE: Magic formatters: named, pure transforms applied to a resolved value.
//! CONTEXT: A reference may end in a formatter name (`$COL.1.join_bullets$`).
//! Formatters turn the stored value into display text or simple markup.
//! Unknown names are handled by the resolver (pass-through with a warning).
//!
//! SUPPORTED NAMES:
//! - display, description
//! - image, image.w150, image.h80, image.120
//! - audio_player
//! - file_download_links, file_download_links_bullets
//! - join_space, join_bullets, join_paragraphs
//! - round0, round1, ... roundN

use crate::column::{Choice, ColumnMetadata, RangeMode};
use crate::numeric::round_half_up_text;
use crate::value::DataValue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MagicFormatter {
    /// Stored choice values shown as their display text.
    Display,
    /// Stored choice values shown as their description.
    Description,
    Image { dimension: Option<String> },
    AudioPlayer,
    FileDownloadLinks { bullets: bool },
    JoinSpace,
    JoinBullets,
    JoinParagraphs,
    Round(u32),
}

impl MagicFormatter {
    /// Looks a formatter up by name. Returns `None` for unknown names.
    pub fn parse(name: &str) -> Option<MagicFormatter> {
        let lower = name.to_ascii_lowercase();
        let formatter = match lower.as_str() {
            "display" => MagicFormatter::Display,
            "description" => MagicFormatter::Description,
            "image" => MagicFormatter::Image { dimension: None },
            "audio_player" => MagicFormatter::AudioPlayer,
            "file_download_links" => MagicFormatter::FileDownloadLinks { bullets: false },
            "file_download_links_bullets" => MagicFormatter::FileDownloadLinks { bullets: true },
            "join_space" => MagicFormatter::JoinSpace,
            "join_bullets" => MagicFormatter::JoinBullets,
            "join_paragraphs" => MagicFormatter::JoinParagraphs,
            other => {
                if let Some(dimension) = other.strip_prefix("image.") {
                    return parse_dimension(dimension).map(|_| MagicFormatter::Image {
                        dimension: Some(dimension.to_string()),
                    });
                }
                let places = other.strip_prefix("round")?;
                if places.is_empty() || !places.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                MagicFormatter::Round(places.parse().ok().filter(|p| *p <= 15)?)
            }
        };
        Some(formatter)
    }

    /// Applies the transform. `column` and `sub_field` are only consulted by
    /// the choice-mapping formatters.
    pub fn apply(&self, value: &DataValue, column: Option<&ColumnMetadata>, sub_field: Option<usize>) -> String {
        match self {
            MagicFormatter::Display | MagicFormatter::Description => {
                let choices = column.map_or(&[][..], |c| c.choices_for(sub_field));
                let range_mode = column
                    .zip(sub_field)
                    .and_then(|(c, i)| c.sub_field(i))
                    .and_then(|s| s.range_mode);
                let describe = *self == MagicFormatter::Description;
                non_blank_items(value)
                    .iter()
                    .map(|item| map_choice(item, choices, range_mode, describe))
                    .collect::<Vec<_>>()
                    .join(", ")
            }
            MagicFormatter::Image { dimension } => {
                let style = dimension
                    .as_deref()
                    .and_then(parse_dimension)
                    .map(|d| d.style())
                    .unwrap_or_default();
                non_blank_items(value)
                    .iter()
                    .map(|src| format!("<img src=\"{}\"{}>", src, style))
                    .collect::<Vec<_>>()
                    .join("")
            }
            MagicFormatter::AudioPlayer => non_blank_items(value)
                .iter()
                .map(|src| format!("<audio controls src=\"{}\"></audio>", src))
                .collect::<Vec<_>>()
                .join("<br>"),
            MagicFormatter::FileDownloadLinks { bullets } => {
                let links: Vec<String> = value
                    .flatten()
                    .iter()
                    .filter_map(file_link)
                    .collect();
                if links.is_empty() {
                    String::new()
                } else if *bullets {
                    wrap_list(&links)
                } else {
                    links.join("<br>")
                }
            }
            MagicFormatter::JoinSpace => non_blank_items(value).join(" "),
            MagicFormatter::JoinBullets => {
                let items = non_blank_items(value);
                if items.is_empty() {
                    String::new()
                } else {
                    wrap_list(&items)
                }
            }
            MagicFormatter::JoinParagraphs => non_blank_items(value)
                .iter()
                .map(|item| format!("<p>{}</p>", item))
                .collect(),
            MagicFormatter::Round(places) => match value.as_number() {
                Some(n) => round_half_up_text(n, *places),
                None => value.to_text(),
            },
        }
    }
}

/// Leaf values as text, blanks removed.
fn non_blank_items(value: &DataValue) -> Vec<String> {
    value
        .flatten()
        .iter()
        .filter(|item| !item.is_blank())
        .map(DataValue::to_text)
        .collect()
}

fn wrap_list(items: &[String]) -> String {
    let body: String = items.iter().map(|item| format!("<li>{}</li>", item)).collect();
    format!("<ul>{}</ul>", body)
}

fn file_link(item: &DataValue) -> Option<String> {
    match item {
        DataValue::Map(fields) => {
            let url = fields.get("url")?.to_text();
            let name = fields
                .get("original_filename")
                .or_else(|| fields.get("name"))
                .map(DataValue::to_text)
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| url.clone());
            Some(format!("<a href=\"{}\">{}</a>", url, name))
        }
        other if !other.is_blank() => {
            let url = other.to_text();
            Some(format!("<a href=\"{}\">{}</a>", url, url))
        }
        _ => None,
    }
}

fn map_choice(item: &str, choices: &[Choice], range_mode: Option<RangeMode>, describe: bool) -> String {
    let pick = |choice: &Choice| {
        if describe {
            choice.description.clone()
        } else {
            choice.display.clone()
        }
    };

    if let Some(choice) = choices.iter().find(|c| c.value == item) {
        return pick(choice);
    }

    // Sliders store arbitrary numbers; snap them onto the declared choices
    let (Some(mode), Ok(n)) = (range_mode, item.trim().parse::<f64>()) else {
        return item.to_string();
    };
    let numeric = choices
        .iter()
        .filter_map(|c| c.value.trim().parse::<f64>().ok().map(|v| (v, c)));
    let snapped = match mode {
        RangeMode::RoundUp => numeric
            .filter(|(v, _)| *v >= n)
            .min_by(|a, b| a.0.total_cmp(&b.0)),
        RangeMode::RoundDown => numeric
            .filter(|(v, _)| *v <= n)
            .max_by(|a, b| a.0.total_cmp(&b.0)),
    };
    snapped.map_or_else(|| item.to_string(), |(_, choice)| pick(choice))
}

/// Image sizing parsed from a formatter suffix.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Dimension {
    Width(u32),
    Height(u32),
    Max(u32),
}

impl Dimension {
    fn style(self) -> String {
        match self {
            Dimension::Width(px) => format!(" style=\"width:{}px;\"", px),
            Dimension::Height(px) => format!(" style=\"height:{}px;\"", px),
            Dimension::Max(px) => format!(" style=\"max-width:{}px;max-height:{}px;\"", px, px),
        }
    }
}

fn parse_dimension(spec: &str) -> Option<Dimension> {
    if let Some(px) = spec.strip_prefix('w') {
        px.parse().ok().map(Dimension::Width)
    } else if let Some(px) = spec.strip_prefix('h') {
        px.parse().ok().map(Dimension::Height)
    } else {
        spec.parse().ok().map(Dimension::Max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{SubField, SubFieldKind};
    use std::collections::BTreeMap;

    fn list(items: &[&str]) -> DataValue {
        DataValue::from(items.to_vec())
    }

    #[test]
    fn parse_known_and_unknown_names() {
        assert_eq!(MagicFormatter::parse("round1"), Some(MagicFormatter::Round(1)));
        assert_eq!(MagicFormatter::parse("JOIN_BULLETS"), Some(MagicFormatter::JoinBullets));
        assert_eq!(
            MagicFormatter::parse("image.w150"),
            Some(MagicFormatter::Image { dimension: Some("w150".to_string()) })
        );
        assert_eq!(MagicFormatter::parse("round"), None);
        assert_eq!(MagicFormatter::parse("sparkle"), None);
        assert_eq!(MagicFormatter::parse("image.wide"), None);
    }

    #[test]
    fn joins_drop_empty_elements() {
        let value = list(&["a", "", "b"]);
        assert_eq!(MagicFormatter::JoinSpace.apply(&value, None, None), "a b");
        assert_eq!(
            MagicFormatter::JoinBullets.apply(&value, None, None),
            "<ul><li>a</li><li>b</li></ul>"
        );
        assert_eq!(
            MagicFormatter::JoinParagraphs.apply(&value, None, None),
            "<p>a</p><p>b</p>"
        );
        assert_eq!(MagicFormatter::JoinBullets.apply(&list(&[]), None, None), "");
    }

    #[test]
    fn round_formats_fixed_places() {
        assert_eq!(MagicFormatter::Round(1).apply(&DataValue::Number(3.14159), None, None), "3.1");
        assert_eq!(MagicFormatter::Round(0).apply(&DataValue::text("2.5"), None, None), "3");
        assert_eq!(MagicFormatter::Round(2).apply(&DataValue::text("n/a"), None, None), "n/a");
    }

    #[test]
    fn display_maps_choice_values() {
        let mut column = ColumnMetadata::multi_field(
            "COL",
            "T",
            "Rubric",
            vec![SubField::new("Grade").with_choices(
                SubFieldKind::Select,
                vec![Choice::new("1", "Pass"), Choice::new("0", "Fail")],
            )],
        );
        column.sub_fields[0].choices[0].description = "Meets the standard".to_string();

        let value = DataValue::text("1");
        assert_eq!(MagicFormatter::Display.apply(&value, Some(&column), Some(0)), "Pass");
        assert_eq!(
            MagicFormatter::Description.apply(&value, Some(&column), Some(0)),
            "Meets the standard"
        );
        assert_eq!(MagicFormatter::Display.apply(&DataValue::text("7"), Some(&column), Some(0)), "7");
    }

    #[test]
    fn slider_values_snap_by_range_mode() {
        let mut column = ColumnMetadata::multi_field(
            "COL",
            "T",
            "Slider",
            vec![SubField::new("Effort").with_choices(
                SubFieldKind::Slider,
                vec![Choice::new("0", "Low"), Choice::new("50", "Mid"), Choice::new("100", "High")],
            )],
        );
        column.sub_fields[0].range_mode = Some(RangeMode::RoundUp);
        assert_eq!(MagicFormatter::Display.apply(&DataValue::Number(42.0), Some(&column), Some(0)), "Mid");
        column.sub_fields[0].range_mode = Some(RangeMode::RoundDown);
        assert_eq!(MagicFormatter::Display.apply(&DataValue::Number(42.0), Some(&column), Some(0)), "Low");
    }

    #[test]
    fn media_markup() {
        let img = MagicFormatter::parse("image.w150").unwrap();
        assert_eq!(
            img.apply(&DataValue::text("a.png"), None, None),
            "<img src=\"a.png\" style=\"width:150px;\">"
        );
        assert_eq!(
            MagicFormatter::AudioPlayer.apply(&list(&["x.mp3", "y.mp3"]), None, None),
            "<audio controls src=\"x.mp3\"></audio><br><audio controls src=\"y.mp3\"></audio>"
        );

        let mut file = BTreeMap::new();
        file.insert("url".to_string(), DataValue::text("/f/1"));
        file.insert("original_filename".to_string(), DataValue::text("essay.pdf"));
        let files = DataValue::List(vec![DataValue::Map(file)]);
        assert_eq!(
            MagicFormatter::FileDownloadLinks { bullets: true }.apply(&files, None, None),
            "<ul><li><a href=\"/f/1\">essay.pdf</a></li></ul>"
        );
    }
}
