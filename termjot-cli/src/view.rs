use termjot_core::model::{BackgroundKind, Element, Page};

/// Text rendition of one page: a header line, then one line per element in
/// z-order, grouped by layer.
pub fn page_lines(page: &Page, index: usize, page_count: usize) -> Vec<String> {
    let background = match page.background().kind {
        BackgroundKind::Plain => "plain".to_string(),
        BackgroundKind::Lined => "lined".to_string(),
        BackgroundKind::Graph => "graph".to_string(),
        BackgroundKind::Pdf { page } => format!("pdf page {}", page + 1),
    };
    let mut lines = vec![format!(
        "Page {}/{}  {:.0}x{:.0}pt  {} #{:06x}",
        index + 1,
        page_count,
        page.width(),
        page.height(),
        background,
        page.background().color & 0xff_ffff
    )];
    for (layer_index, layer) in page.layers().iter().enumerate() {
        let marker = if layer_index == page.selected_layer_index() {
            '>'
        } else {
            ' '
        };
        lines.push(format!("{marker} layer {} ({} elements)", layer_index + 1, layer.len()));
        for (i, element) in layer.elements().iter().enumerate() {
            lines.push(format!("    {:>3}  {}", i + 1, describe(element)));
        }
    }
    lines
}

fn describe(element: &Element) -> String {
    let bounds = element.bounds();
    let detail = match element {
        Element::Stroke(stroke) => format!(
            "{} points, width {}, #{:06x}",
            stroke.points.len(),
            stroke.width,
            stroke.color & 0xff_ffff
        ),
        Element::Text(text) => format!("{:?} #{:06x}", text.text, text.color & 0xff_ffff),
        Element::Image(_) => "image".to_string(),
        Element::TexImage(tex) => format!("tex {:?}", tex.source),
    };
    format!(
        "{:<8} at {:.0},{:.0}  {}",
        element.kind_name(),
        bounds.x,
        bounds.y,
        detail
    )
}

pub fn truncate_with_ellipsis(mut text: String, width: usize) -> String {
    if width == 0 {
        return String::new();
    }
    if text.chars().count() <= width {
        return text;
    }
    let keep = width.saturating_sub(1);
    let cut = text
        .char_indices()
        .nth(keep)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    text.truncate(cut);
    text.push('…');
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use termjot_core::model::{Font, PageTemplate, Point, Text, BLACK};

    #[test]
    fn page_lines_list_elements_under_their_layer() {
        let mut page = Page::from_template(&PageTemplate::default());
        page.selected_layer_mut().add_element(Element::Text(Text {
            position: Point::new(5.0, 7.0),
            text: "hello".into(),
            font: Font::default(),
            color: BLACK,
        }));
        let lines = page_lines(&page, 1, 3);
        assert!(lines[0].starts_with("Page 2/3"));
        assert_eq!(lines[1], "> layer 1 (1 elements)");
        assert!(lines[2].contains("Text"));
        assert!(lines[2].contains("\"hello\""));
    }

    #[test]
    fn truncate_adds_ellipsis_only_when_needed() {
        assert_eq!(truncate_with_ellipsis("short".into(), 10), "short");
        assert_eq!(truncate_with_ellipsis("abcdef".into(), 4), "abc…");
        assert_eq!(truncate_with_ellipsis("abc".into(), 0), "");
    }
}
