use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::utils::{clean_text, PaperResult};

/// Form XObject 最大嵌套深度
const MAX_FORM_DEPTH: u32 = 3;
/// 没有字宽信息时按字号的一半估算字符宽度
const GLYPH_WIDTH_RATIO: f64 = 0.5;
/// 同一基线上相距超过 2 倍字号的片段属于不同分栏
const COLUMN_GAP_RATIO: f64 = 2.0;

/// 页面坐标系下的矩形，原点在左上角，y 向下
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl Rect {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self {
            x0: x0.min(x1),
            y0: y0.min(y1),
            x1: x0.max(x1),
            y1: y0.max(y1),
        }
    }

    pub fn width(&self) -> f64 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f64 {
        self.y1 - self.y0
    }

    pub fn area(&self) -> f64 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn intersection_area(&self, other: &Rect) -> f64 {
        let w = self.x1.min(other.x1) - self.x0.max(other.x0);
        let h = self.y1.min(other.y1) - self.y0.max(other.y0);
        if w <= 0.0 || h <= 0.0 {
            0.0
        } else {
            w * h
        }
    }

    pub fn iou(&self, other: &Rect) -> f64 {
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// 自身面积落在 other 内的比例
    pub fn contained_in(&self, other: &Rect) -> f64 {
        let area = self.area();
        if area <= 0.0 {
            0.0
        } else {
            self.intersection_area(other) / area
        }
    }

    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    /// 水平方向是否重叠，slack 为两侧额外放宽的距离
    pub fn overlaps_x(&self, other: &Rect, slack: f64) -> bool {
        self.x0 - slack <= other.x1 && other.x0 <= self.x1 + slack
    }
}

/// PDF 变换矩阵 [a b c d e f]，行向量约定
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl Matrix {
    pub const IDENTITY: Matrix = Matrix {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        e: 0.0,
        f: 0.0,
    };

    pub fn translate(tx: f64, ty: f64) -> Self {
        Matrix {
            e: tx,
            f: ty,
            ..Self::IDENTITY
        }
    }

    fn from_operands(operands: &[Object]) -> Option<Self> {
        if operands.len() < 6 {
            return None;
        }
        let v: Vec<f64> = operands.iter().take(6).filter_map(as_number).collect();
        if v.len() < 6 {
            return None;
        }
        Some(Matrix {
            a: v[0],
            b: v[1],
            c: v[2],
            d: v[3],
            e: v[4],
            f: v[5],
        })
    }

    /// self × other：先应用 self，再应用 other
    pub fn then(&self, other: &Matrix) -> Matrix {
        Matrix {
            a: self.a * other.a + self.b * other.c,
            b: self.a * other.b + self.b * other.d,
            c: self.c * other.a + self.d * other.c,
            d: self.c * other.b + self.d * other.d,
            e: self.e * other.a + self.f * other.c + other.e,
            f: self.e * other.b + self.f * other.d + other.f,
        }
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (self.a * x + self.c * y + self.e, self.b * x + self.d * y + self.f)
    }

    /// 单位正方形变换后的外接框（PDF 坐标，y 向上）
    pub fn unit_square_bounds(&self) -> (f64, f64, f64, f64) {
        let corners = [self.apply(0.0, 0.0), self.apply(1.0, 0.0), self.apply(0.0, 1.0), self.apply(1.0, 1.0)];
        let mut bounds = (f64::MAX, f64::MAX, f64::MIN, f64::MIN);
        for (x, y) in corners {
            bounds.0 = bounds.0.min(x);
            bounds.1 = bounds.1.min(y);
            bounds.2 = bounds.2.max(x);
            bounds.3 = bounds.3.max(y);
        }
        bounds
    }

    fn vertical_scale(&self) -> f64 {
        (self.c * self.c + self.d * self.d).sqrt()
    }
}

/// 页面上放置的一张位图
#[derive(Debug, Clone)]
pub struct ImagePlacement {
    pub object_id: ObjectId,
    pub bbox: Rect,
    pub pixel_width: u32,
    pub pixel_height: u32,
}

/// 按基线合并后的一行文字
#[derive(Debug, Clone)]
pub struct TextLine {
    pub text: String,
    pub bbox: Rect,
}

#[derive(Debug, Clone)]
pub struct PageLayout {
    /// 从 1 开始
    pub page_number: u32,
    pub width: f64,
    pub height: f64,
    pub images: Vec<ImagePlacement>,
    pub lines: Vec<TextLine>,
}

#[derive(Debug, Clone)]
struct TextRun {
    text: String,
    x: f64,
    baseline: f64,
    end_x: f64,
    size: f64,
}

#[derive(Debug, Clone, Copy)]
struct TextState {
    matrix: Matrix,
    line_matrix: Matrix,
    font_size: f64,
    leading: f64,
}

impl Default for TextState {
    fn default() -> Self {
        Self {
            matrix: Matrix::IDENTITY,
            line_matrix: Matrix::IDENTITY,
            font_size: 0.0,
            leading: 0.0,
        }
    }
}

struct LayoutWalker<'a> {
    doc: &'a Document,
    images: Vec<ImagePlacement>,
    runs: Vec<TextRun>,
}

impl<'a> LayoutWalker<'a> {
    fn walk(&mut self, operations: &[Operation], xobjects: &BTreeMap<Vec<u8>, ObjectId>, base: Matrix, depth: u32) {
        let mut ctm = base;
        let mut stack: Vec<Matrix> = Vec::new();
        let mut text = TextState::default();

        for op in operations {
            let operands = &op.operands;
            match op.operator.as_str() {
                "q" => stack.push(ctm),
                "Q" => {
                    if let Some(saved) = stack.pop() {
                        ctm = saved;
                    }
                }
                "cm" => {
                    if let Some(m) = Matrix::from_operands(operands) {
                        ctm = m.then(&ctm);
                    }
                }
                "BT" => {
                    text.matrix = Matrix::IDENTITY;
                    text.line_matrix = Matrix::IDENTITY;
                }
                "Tf" => {
                    if let Some(size) = operands.get(1).and_then(as_number) {
                        text.font_size = size;
                    }
                }
                "TL" => {
                    if let Some(leading) = operands.first().and_then(as_number) {
                        text.leading = leading;
                    }
                }
                "Td" | "TD" => {
                    let tx = operands.first().and_then(as_number).unwrap_or(0.0);
                    let ty = operands.get(1).and_then(as_number).unwrap_or(0.0);
                    if op.operator == "TD" {
                        text.leading = -ty;
                    }
                    text.line_matrix = Matrix::translate(tx, ty).then(&text.line_matrix);
                    text.matrix = text.line_matrix;
                }
                "Tm" => {
                    if let Some(m) = Matrix::from_operands(operands) {
                        text.line_matrix = m;
                        text.matrix = m;
                    }
                }
                "T*" => next_line(&mut text),
                "Tj" => {
                    if let Some(Object::String(bytes, _)) = operands.first() {
                        self.show_text(&mut text, &ctm, decode_pdf_string(bytes));
                    }
                }
                "'" => {
                    next_line(&mut text);
                    if let Some(Object::String(bytes, _)) = operands.first() {
                        self.show_text(&mut text, &ctm, decode_pdf_string(bytes));
                    }
                }
                "\"" => {
                    next_line(&mut text);
                    if let Some(Object::String(bytes, _)) = operands.get(2) {
                        self.show_text(&mut text, &ctm, decode_pdf_string(bytes));
                    }
                }
                "TJ" => {
                    if let Some(Object::Array(items)) = operands.first() {
                        let mut joined = String::new();
                        for item in items {
                            match item {
                                Object::String(bytes, _) => joined.push_str(&decode_pdf_string(bytes)),
                                other => {
                                    // 大的负间距相当于一个空格
                                    if as_number(other).map(|n| n < -200.0).unwrap_or(false) {
                                        joined.push(' ');
                                    }
                                }
                            }
                        }
                        self.show_text(&mut text, &ctm, joined);
                    }
                }
                "Do" => {
                    let name = match operands.first().and_then(|o| o.as_name().ok()) {
                        Some(n) => n,
                        None => continue,
                    };
                    if let Some(&object_id) = xobjects.get(name) {
                        self.place_xobject(object_id, &ctm, xobjects, depth);
                    }
                }
                _ => {}
            }
        }
    }

    fn show_text(&mut self, text: &mut TextState, ctm: &Matrix, content: String) {
        let char_count = content.chars().count();
        if char_count == 0 {
            return;
        }
        let advance = char_count as f64 * text.font_size * GLYPH_WIDTH_RATIO;
        let rendering = text.matrix.then(ctm);
        let (x, baseline) = rendering.apply(0.0, 0.0);
        let (end_x, _) = rendering.apply(advance, 0.0);
        let size = (text.font_size * rendering.vertical_scale()).abs().max(1.0);

        if !content.trim().is_empty() {
            self.runs.push(TextRun {
                text: content,
                x: x.min(end_x),
                baseline,
                end_x: x.max(end_x),
                size,
            });
        }
        text.matrix = Matrix::translate(advance, 0.0).then(&text.matrix);
    }

    fn place_xobject(&mut self, object_id: ObjectId, ctm: &Matrix, parent: &BTreeMap<Vec<u8>, ObjectId>, depth: u32) {
        let doc = self.doc;
        let stream = match doc.get_object(object_id).and_then(|o| o.as_stream()) {
            Ok(s) => s,
            Err(_) => return,
        };
        let subtype = stream
            .dict
            .get(b"Subtype")
            .ok()
            .and_then(|s| s.as_name().ok())
            .and_then(|n| std::str::from_utf8(n).ok());

        match subtype {
            Some("Image") => {
                let (x0, y0, x1, y1) = ctm.unit_square_bounds();
                self.images.push(ImagePlacement {
                    object_id,
                    bbox: Rect::new(x0, y0, x1, y1),
                    pixel_width: dict_u32(&stream.dict, b"Width"),
                    pixel_height: dict_u32(&stream.dict, b"Height"),
                });
            }
            Some("Form") => {
                if depth >= MAX_FORM_DEPTH {
                    debug!("Form XObject 嵌套过深，跳过 {:?}", object_id);
                    return;
                }
                let form_matrix = stream
                    .dict
                    .get(b"Matrix")
                    .ok()
                    .and_then(|m| m.as_array().ok())
                    .and_then(|arr| Matrix::from_operands(arr))
                    .unwrap_or(Matrix::IDENTITY);
                let data = stream.decompressed_content().unwrap_or_else(|_| stream.content.clone());
                let content = match Content::decode(&data) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("Form XObject 内容解析失败 {:?}: {}", object_id, e);
                        return;
                    }
                };
                let own = xobjects_in_resources(doc, &stream.dict);
                let xobjects = if own.is_empty() { parent.clone() } else { own };
                self.walk(&content.operations, &xobjects, form_matrix.then(ctm), depth + 1);
            }
            _ => {}
        }
    }
}

fn next_line(text: &mut TextState) {
    text.line_matrix = Matrix::translate(0.0, -text.leading).then(&text.line_matrix);
    text.matrix = text.line_matrix;
}

/// 分析单页：位图位置与文字行，坐标转换为左上角原点
pub fn analyze_page(doc: &Document, page_number: u32, page_id: ObjectId) -> PaperResult<PageLayout> {
    let (mx0, my0, mx1, my1) = media_box(doc, page_id);
    let width = (mx1 - mx0).abs();
    let height = (my1 - my0).abs();
    let top = my0.max(my1);
    let left = mx0.min(mx1);

    let content = doc.get_and_decode_page_content(page_id)?;
    let xobjects = page_xobjects(doc, page_id);

    let mut walker = LayoutWalker {
        doc,
        images: Vec::new(),
        runs: Vec::new(),
    };
    walker.walk(&content.operations, &xobjects, Matrix::IDENTITY, 0);

    let to_page = |x0: f64, y0: f64, x1: f64, y1: f64| Rect::new(x0 - left, top - y1, x1 - left, top - y0);

    let images = walker
        .images
        .into_iter()
        .map(|img| ImagePlacement {
            bbox: to_page(img.bbox.x0, img.bbox.y0, img.bbox.x1, img.bbox.y1),
            ..img
        })
        .collect();

    let lines = group_lines(walker.runs)
        .into_iter()
        .map(|line| TextLine {
            bbox: to_page(line.bbox.x0, line.bbox.y0, line.bbox.x1, line.bbox.y1),
            text: line.text,
        })
        .collect();

    Ok(PageLayout {
        page_number,
        width,
        height,
        images,
        lines,
    })
}

/// 基线相近的文字片段合并为一行，从上到下排列；间距过大的视为分栏，拆成两行
fn group_lines(mut runs: Vec<TextRun>) -> Vec<TextLine> {
    runs.sort_by(|a, b| b.baseline.total_cmp(&a.baseline).then(a.x.total_cmp(&b.x)));

    let mut grouped: Vec<Vec<TextRun>> = Vec::new();
    for run in runs {
        match grouped.last_mut() {
            Some(line) if (line[0].baseline - run.baseline).abs() <= (0.4 * line[0].size).max(2.0) => line.push(run),
            _ => grouped.push(vec![run]),
        }
    }

    let mut segments: Vec<Vec<TextRun>> = Vec::new();
    for mut line in grouped {
        line.sort_by(|a, b| a.x.total_cmp(&b.x));
        let mut current: Vec<TextRun> = Vec::new();
        for run in line {
            let gutter = current
                .last()
                .map(|prev| run.x - prev.end_x > COLUMN_GAP_RATIO * prev.size.max(run.size))
                .unwrap_or(false);
            if gutter {
                segments.push(std::mem::take(&mut current));
            }
            current.push(run);
        }
        if !current.is_empty() {
            segments.push(current);
        }
    }

    segments.into_iter().filter_map(|segment| merge_runs(&segment)).collect()
}

fn merge_runs(line: &[TextRun]) -> Option<TextLine> {
    let size = line.iter().map(|r| r.size).fold(0.0, f64::max);
    let baseline = line.first()?.baseline;
    let mut text = String::new();
    let mut last_end: Option<f64> = None;
    for run in line {
        if let Some(end) = last_end {
            if run.x - end > 0.15 * size && !text.ends_with(' ') && !run.text.starts_with(' ') {
                text.push(' ');
            }
        }
        text.push_str(&run.text);
        last_end = Some(run.end_x);
    }
    let text = clean_text(&text);
    if text.is_empty() {
        return None;
    }
    let x0 = line.iter().map(|r| r.x).fold(f64::MAX, f64::min);
    let x1 = line.iter().map(|r| r.end_x).fold(f64::MIN, f64::max);
    Some(TextLine {
        text,
        bbox: Rect::new(x0, baseline - 0.2 * size, x1, baseline + 0.8 * size),
    })
}

/// 解码 PDF 字符串：带 BOM 的按 UTF-16BE，否则按 Latin-1
pub fn decode_pdf_string(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks(2)
            .filter(|c| c.len() == 2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    bytes.iter().map(|&b| b as char).collect()
}

pub fn as_number(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(*r as f64),
        _ => None,
    }
}

fn dict_u32(dict: &Dictionary, key: &[u8]) -> u32 {
    dict.get(key)
        .ok()
        .and_then(|v| v.as_i64().ok())
        .map(|v| v.max(0) as u32)
        .unwrap_or(0)
}

/// MediaBox 可能继承自父节点，找不到时按 A4 处理
fn media_box(doc: &Document, page_id: ObjectId) -> (f64, f64, f64, f64) {
    let mut current = Some(page_id);
    let mut hops = 0;
    while let Some(id) = current {
        let dict = match doc.get_dictionary(id) {
            Ok(d) => d,
            Err(_) => break,
        };
        if let Some(values) = dict
            .get(b"MediaBox")
            .ok()
            .and_then(|o| doc.dereference(o).ok())
            .and_then(|(_, o)| o.as_array().ok())
            .map(|arr| arr.iter().filter_map(as_number).collect::<Vec<f64>>())
        {
            if values.len() == 4 {
                return (values[0], values[1], values[2], values[3]);
            }
        }
        current = dict.get(b"Parent").ok().and_then(|p| p.as_reference().ok());
        hops += 1;
        if hops > 16 {
            break;
        }
    }
    (0.0, 0.0, 595.0, 842.0)
}

/// 页面可用的 XObject（含继承的 Resources）
fn page_xobjects(doc: &Document, page_id: ObjectId) -> BTreeMap<Vec<u8>, ObjectId> {
    let mut map = BTreeMap::new();
    let (inline, referenced) = doc.get_page_resources(page_id);

    let mut dicts: Vec<&Dictionary> = Vec::new();
    if let Some(dict) = inline {
        dicts.push(dict);
    }
    for id in referenced {
        if let Ok(dict) = doc.get_dictionary(id) {
            dicts.push(dict);
        }
    }

    for resources in dicts {
        for (name, id) in xobjects_from_resources(doc, resources) {
            map.entry(name).or_insert(id);
        }
    }
    map
}

/// 从带 Resources 的字典（页面或 Form）中取 XObject 表
fn xobjects_in_resources(doc: &Document, dict: &Dictionary) -> BTreeMap<Vec<u8>, ObjectId> {
    dict.get(b"Resources")
        .ok()
        .and_then(|r| doc.dereference(r).ok())
        .and_then(|(_, r)| r.as_dict().ok())
        .map(|resources| xobjects_from_resources(doc, resources))
        .unwrap_or_default()
}

fn xobjects_from_resources(doc: &Document, resources: &Dictionary) -> BTreeMap<Vec<u8>, ObjectId> {
    let mut map = BTreeMap::new();
    let xobject_dict = resources
        .get(b"XObject")
        .ok()
        .and_then(|x| doc.dereference(x).ok())
        .and_then(|(_, x)| x.as_dict().ok());
    if let Some(dict) = xobject_dict {
        for (name, value) in dict.iter() {
            if let Ok(id) = value.as_reference() {
                map.insert(name.clone(), id);
            }
        }
    }
    map
}
