use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 0xRRGGBB
pub type Color = u32;

pub const BLACK: Color = 0x000000;
pub const WHITE: Color = 0xffffff;

/// Stable identity of a page for as long as some owner (the document or an undo
/// action) keeps it alive. Handles are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId(Uuid);

impl PageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for PageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn translate(self, dx: f64, dy: f64) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    fn from_points(points: &[Point]) -> Self {
        let mut min_x = f64::INFINITY;
        let mut min_y = f64::INFINITY;
        let mut max_x = f64::NEG_INFINITY;
        let mut max_y = f64::NEG_INFINITY;
        for p in points {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        if points.is_empty() {
            return Self {
                x: 0.0,
                y: 0.0,
                width: 0.0,
                height: 0.0,
            };
        }
        Self {
            x: min_x,
            y: min_y,
            width: max_x - min_x,
            height: max_y - min_y,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineStyle {
    #[default]
    Solid,
    Dashed,
    Dotted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Font {
    pub family: String,
    pub size: f64,
}

impl Default for Font {
    fn default() -> Self {
        Self {
            family: "Sans".to_string(),
            size: 12.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub points: Vec<Point>,
    pub width: f64,
    pub color: Color,
    /// Fill alpha (0-255); `None` means the stroke is not filled.
    #[serde(default)]
    pub fill: Option<u8>,
    #[serde(default)]
    pub line_style: LineStyle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Text {
    pub position: Point,
    pub text: String,
    #[serde(default)]
    pub font: Font,
    pub color: Color,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub position: Point,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TexImage {
    pub position: Point,
    pub width: f64,
    pub height: f64,
    pub source: String,
    #[serde(default)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Element {
    Stroke(Stroke),
    Text(Text),
    Image(Image),
    TexImage(TexImage),
}

/// Names accepted in the `kind` tag of a serialized element.
pub const ELEMENT_KINDS: [&str; 4] = ["Stroke", "Text", "Image", "TexImage"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    Color,
    Size,
    Fill,
    Font,
    LineStyle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ElementProperty {
    Color(Color),
    Size(f64),
    Fill(Option<u8>),
    Font(Font),
    LineStyle(LineStyle),
}

impl ElementProperty {
    pub fn kind(&self) -> PropertyKind {
        match self {
            ElementProperty::Color(_) => PropertyKind::Color,
            ElementProperty::Size(_) => PropertyKind::Size,
            ElementProperty::Fill(_) => PropertyKind::Fill,
            ElementProperty::Font(_) => PropertyKind::Font,
            ElementProperty::LineStyle(_) => PropertyKind::LineStyle,
        }
    }
}

impl Element {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Element::Stroke(_) => "Stroke",
            Element::Text(_) => "Text",
            Element::Image(_) => "Image",
            Element::TexImage(_) => "TexImage",
        }
    }

    pub fn bounds(&self) -> Rect {
        match self {
            Element::Stroke(stroke) => Rect::from_points(&stroke.points),
            Element::Text(text) => Rect {
                x: text.position.x,
                y: text.position.y,
                // rough metrics: half an em per glyph
                width: text.text.chars().count() as f64 * text.font.size * 0.5,
                height: text.font.size,
            },
            Element::Image(image) => Rect {
                x: image.position.x,
                y: image.position.y,
                width: image.width,
                height: image.height,
            },
            Element::TexImage(tex) => Rect {
                x: tex.position.x,
                y: tex.position.y,
                width: tex.width,
                height: tex.height,
            },
        }
    }

    pub fn translate(&mut self, dx: f64, dy: f64) {
        match self {
            Element::Stroke(stroke) => {
                for point in &mut stroke.points {
                    *point = point.translate(dx, dy);
                }
            }
            Element::Text(text) => text.position = text.position.translate(dx, dy),
            Element::Image(image) => image.position = image.position.translate(dx, dy),
            Element::TexImage(tex) => tex.position = tex.position.translate(dx, dy),
        }
    }

    /// Current value of `kind`, or `None` when the element has no such property.
    pub fn property(&self, kind: PropertyKind) -> Option<ElementProperty> {
        match (self, kind) {
            (Element::Stroke(s), PropertyKind::Color) => Some(ElementProperty::Color(s.color)),
            (Element::Stroke(s), PropertyKind::Size) => Some(ElementProperty::Size(s.width)),
            (Element::Stroke(s), PropertyKind::Fill) => Some(ElementProperty::Fill(s.fill)),
            (Element::Stroke(s), PropertyKind::LineStyle) => {
                Some(ElementProperty::LineStyle(s.line_style))
            }
            (Element::Text(t), PropertyKind::Color) => Some(ElementProperty::Color(t.color)),
            (Element::Text(t), PropertyKind::Size) => Some(ElementProperty::Size(t.font.size)),
            (Element::Text(t), PropertyKind::Font) => Some(ElementProperty::Font(t.font.clone())),
            _ => None,
        }
    }

    /// Returns `false` (and leaves the element untouched) when the property does
    /// not apply to this kind of element.
    pub fn set_property(&mut self, value: &ElementProperty) -> bool {
        match (self, value) {
            (Element::Stroke(s), ElementProperty::Color(c)) => s.color = *c,
            (Element::Stroke(s), ElementProperty::Size(w)) => s.width = *w,
            (Element::Stroke(s), ElementProperty::Fill(f)) => s.fill = *f,
            (Element::Stroke(s), ElementProperty::LineStyle(l)) => s.line_style = *l,
            (Element::Text(t), ElementProperty::Color(c)) => t.color = *c,
            (Element::Text(t), ElementProperty::Size(size)) => t.font.size = *size,
            (Element::Text(t), ElementProperty::Font(font)) => t.font = font.clone(),
            _ => return false,
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    elements: Vec<Element>,
}

impl Layer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn element(&self, index: usize) -> Option<&Element> {
        self.elements.get(index)
    }

    pub fn element_mut(&mut self, index: usize) -> Option<&mut Element> {
        self.elements.get_mut(index)
    }

    /// Appends on top of the z-order and returns the new index.
    pub fn add_element(&mut self, element: Element) -> usize {
        self.elements.push(element);
        self.elements.len() - 1
    }

    /// Inserts at `index`, clamped to the end of the layer. Returns the index used.
    pub fn insert_element(&mut self, index: usize, element: Element) -> usize {
        let index = index.min(self.elements.len());
        self.elements.insert(index, element);
        index
    }

    pub fn remove_element(&mut self, index: usize) -> Option<Element> {
        if index < self.elements.len() {
            Some(self.elements.remove(index))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundKind {
    #[default]
    Plain,
    Lined,
    Graph,
    /// A page of the attached background file.
    Pdf { page: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Background {
    pub kind: BackgroundKind,
    pub color: Color,
}

impl Default for Background {
    fn default() -> Self {
        Self {
            kind: BackgroundKind::Plain,
            color: WHITE,
        }
    }
}

/// Size and background applied to freshly created pages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageTemplate {
    pub width: f64,
    pub height: f64,
    pub background: Background,
}

impl Default for PageTemplate {
    fn default() -> Self {
        Self {
            width: 595.275_59,
            height: 841.889_76,
            background: Background::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    #[serde(skip, default)]
    id: PageId,
    width: f64,
    height: f64,
    #[serde(default)]
    background: Background,
    layers: Vec<Layer>,
    #[serde(default)]
    selected_layer: usize,
}

impl Page {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            id: PageId::new(),
            width,
            height,
            background: Background::default(),
            layers: vec![Layer::new()],
            selected_layer: 0,
        }
    }

    pub fn from_template(template: &PageTemplate) -> Self {
        let mut page = Self::new(template.width, template.height);
        page.background = template.background;
        page
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn width(&self) -> f64 {
        self.width
    }

    pub fn height(&self) -> f64 {
        self.height
    }

    pub fn set_size(&mut self, width: f64, height: f64) {
        self.width = width;
        self.height = height;
    }

    pub fn background(&self) -> &Background {
        &self.background
    }

    pub fn set_background_color(&mut self, color: Color) {
        self.background.color = color;
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index)
    }

    pub fn layer_mut(&mut self, index: usize) -> Option<&mut Layer> {
        self.layers.get_mut(index)
    }

    pub fn add_layer(&mut self, layer: Layer) -> usize {
        self.layers.push(layer);
        self.layers.len() - 1
    }

    pub fn selected_layer_index(&self) -> usize {
        self.selected_layer.min(self.layers.len().saturating_sub(1))
    }

    pub fn select_layer(&mut self, index: usize) -> bool {
        if index < self.layers.len() {
            self.selected_layer = index;
            true
        } else {
            false
        }
    }

    /// The layer new elements go to; a page without layers gets one on demand.
    pub fn selected_layer_mut(&mut self) -> &mut Layer {
        if self.layers.is_empty() {
            self.layers.push(Layer::new());
        }
        let index = self.selected_layer_index();
        &mut self.layers[index]
    }

    pub fn element_count(&self) -> usize {
        self.layers.iter().map(Layer::len).sum()
    }

    pub fn is_background_file_page(&self) -> bool {
        matches!(self.background.kind, BackgroundKind::Pdf { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(skip)]
    filename: Option<PathBuf>,
    #[serde(default)]
    background_file: Option<PathBuf>,
    #[serde(default)]
    attach_background: bool,
    pages: Vec<Page>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(template: &PageTemplate) -> Self {
        let mut document = Self::new();
        document.add_page(Page::from_template(template));
        document
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    pub fn set_filename(&mut self, filename: Option<PathBuf>) {
        self.filename = filename;
    }

    pub fn background_file(&self) -> Option<&Path> {
        self.background_file.as_deref()
    }

    pub fn set_background_file(&mut self, path: Option<PathBuf>, attach: bool) {
        self.background_file = path;
        self.attach_background = attach;
    }

    pub fn attaches_background(&self) -> bool {
        self.attach_background
    }

    /// File name shown to the user, falling back to the background file.
    pub fn display_name(&self) -> Option<String> {
        self.filename
            .as_deref()
            .or(self.background_file.as_deref())
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn page(&self, index: usize) -> Option<&Page> {
        self.pages.get(index)
    }

    pub fn page_mut(&mut self, index: usize) -> Option<&mut Page> {
        self.pages.get_mut(index)
    }

    pub fn index_of(&self, id: PageId) -> Option<usize> {
        self.pages.iter().position(|page| page.id == id)
    }

    pub fn page_by_id(&self, id: PageId) -> Option<&Page> {
        self.pages.iter().find(|page| page.id == id)
    }

    pub fn page_by_id_mut(&mut self, id: PageId) -> Option<&mut Page> {
        self.pages.iter_mut().find(|page| page.id == id)
    }

    pub fn add_page(&mut self, page: Page) -> usize {
        self.pages.push(page);
        self.pages.len() - 1
    }

    /// Inserts before `index`, clamped to the end. Returns the index used.
    pub fn insert_page(&mut self, page: Page, index: usize) -> usize {
        let index = index.min(self.pages.len());
        self.pages.insert(index, page);
        index
    }

    pub fn delete_page(&mut self, index: usize) -> Option<Page> {
        if index < self.pages.len() {
            Some(self.pages.remove(index))
        } else {
            None
        }
    }

    pub fn set_page_size(&mut self, index: usize, width: f64, height: f64) -> bool {
        match self.pages.get_mut(index) {
            Some(page) => {
                page.set_size(width, height);
                true
            }
            None => false,
        }
    }

    /// Drops every page and forgets the file names. Handles to the old pages no
    /// longer resolve afterwards.
    pub fn clear(&mut self) {
        self.pages.clear();
        self.filename = None;
        self.background_file = None;
        self.attach_background = false;
    }

    pub fn element_count(&self) -> usize {
        self.pages.iter().map(Page::element_count).sum()
    }
}
