//! Listing parser for the Chamber of Deputies project search page.

use async_trait::async_trait;
use billwatch_core::{ScrapedRecord, NO_DATA};
use billwatch_storage::HttpFetcher;
use chrono::Utc;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

use crate::{AdapterError, ChamberAdapter, FetchedPage, ListingTarget};

pub const DIPUTADOS_LISTING_URL: &str = "https://www.diputados.gov.ar/proyectos/";

const ORIGIN_LABEL: &str = "Diputados";

#[derive(Debug, Clone, Copy, Default)]
pub struct DiputadosAdapter;

/// Per-label extraction result for one project block. `None` means the label
/// was not found; [`ExtractedFields::into_record`] maps those to [`NO_DATA`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedFields {
    pub case_id: Option<String>,
    pub author: Option<String>,
    pub start_date: Option<String>,
    pub project_text: Option<String>,
    pub committees: Option<String>,
    pub party: Option<String>,
    pub province: Option<String>,
}

impl ExtractedFields {
    pub fn into_record(self, origin_chamber: &str) -> ScrapedRecord {
        let or_no_data = |v: Option<String>| v.unwrap_or_else(|| NO_DATA.to_string());
        ScrapedRecord {
            origin_chamber: origin_chamber.to_string(),
            case_id: or_no_data(self.case_id),
            author: or_no_data(self.author),
            start_date: or_no_data(self.start_date),
            project_text: or_no_data(self.project_text),
            committees: or_no_data(self.committees),
            party: or_no_data(self.party),
            province: or_no_data(self.province),
        }
    }
}

struct Selectors {
    block: Selector,
    span: Selector,
    texto: Selector,
    h5: Selector,
    table: Selector,
    body_row: Selector,
    cell: Selector,
}

impl Selectors {
    fn new() -> Result<Self, AdapterError> {
        let parse = |s: &str| Selector::parse(s).map_err(|e| AdapterError::Message(e.to_string()));
        Ok(Self {
            block: parse("div.dp-metadata")?,
            span: parse("span")?,
            texto: parse("div.dp-texto")?,
            h5: parse("h5")?,
            table: parse("table")?,
            body_row: parse("tbody tr")?,
            cell: parse("td")?,
        })
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>()
}

/// Text after the last `:` of the first span mentioning `label`.
fn labeled_span(block: ElementRef<'_>, sel: &Selectors, label: &str) -> Option<String> {
    block
        .select(&sel.span)
        .map(element_text)
        .find(|text| text.contains(label))
        .and_then(|text| text.rsplit(':').next().map(|v| v.trim().to_string()))
}

/// First table after the `h5` heading that mentions `heading`.
fn table_after_heading<'a>(
    container: ElementRef<'a>,
    sel: &Selectors,
    heading: &str,
) -> Option<ElementRef<'a>> {
    let h5 = container
        .select(&sel.h5)
        .find(|h| element_text(*h).contains(heading))?;
    h5.next_siblings()
        .filter_map(ElementRef::wrap)
        .find_map(|el| {
            if el.value().name() == "table" {
                Some(el)
            } else {
                el.select(&sel.table).next()
            }
        })
}

fn extract_signers(container: ElementRef<'_>, sel: &Selectors, fields: &mut ExtractedFields) {
    let Some(table) = table_after_heading(container, sel, "FIRMANTES") else {
        return;
    };
    let Some(first_row) = table.select(&sel.body_row).next() else {
        return;
    };
    let cells: Vec<String> = first_row
        .select(&sel.cell)
        .map(|td| element_text(td).trim().to_string())
        .collect();
    match cells.len() {
        n if n >= 3 => {
            fields.author = Some(cells[0].clone());
            fields.province = Some(cells[1].clone());
            fields.party = Some(cells[2].clone());
        }
        1 => fields.author = Some(cells[0].clone()),
        _ => {}
    }
}

fn extract_committees(container: ElementRef<'_>, sel: &Selectors) -> Option<String> {
    let table = table_after_heading(container, sel, "GIRO")?;
    let names: Vec<String> = table
        .select(&sel.body_row)
        .map(|tr| element_text(tr).trim().replace('\n', ""))
        .collect();
    Some(names.join(", "))
}

fn extract_block(block: ElementRef<'_>, sel: &Selectors) -> ExtractedFields {
    let mut fields = ExtractedFields {
        case_id: labeled_span(block, sel, "Expediente"),
        start_date: labeled_span(block, sel, "Fecha"),
        ..ExtractedFields::default()
    };

    let Some(container) = block.parent().and_then(ElementRef::wrap) else {
        return fields;
    };
    fields.project_text = container
        .select(&sel.texto)
        .next()
        .map(|div| element_text(div).trim().to_string());
    extract_signers(container, sel, &mut fields);
    fields.committees = extract_committees(container, sel);
    fields
}

/// Parse every `div.dp-metadata` project block of a rendered listing.
pub fn parse_listing_html(html: &str, origin_chamber: &str) -> Result<Vec<ScrapedRecord>, AdapterError> {
    let sel = Selectors::new()?;
    let document = Html::parse_document(html);
    let records: Vec<ScrapedRecord> = document
        .select(&sel.block)
        .map(|block| extract_block(block, &sel).into_record(origin_chamber))
        .collect();
    if records.is_empty() {
        warn!("listing contains no project blocks; page layout may have changed");
    }
    Ok(records)
}

#[async_trait]
impl ChamberAdapter for DiputadosAdapter {
    fn chamber(&self) -> &'static str {
        "diputados"
    }

    fn origin_label(&self) -> &'static str {
        ORIGIN_LABEL
    }

    fn default_listing_url(&self) -> &'static str {
        DIPUTADOS_LISTING_URL
    }

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        target: &ListingTarget,
    ) -> Result<FetchedPage, AdapterError> {
        let resp = http.fetch_bytes(&target.url).await?;
        debug!(url = %resp.final_url, bytes = resp.body.len(), "fetched listing");
        Ok(FetchedPage {
            url: resp.final_url,
            content_type: "text/html".to_string(),
            body: resp.body,
            fetched_at: Utc::now(),
        })
    }

    fn parse_listing(&self, page: &FetchedPage) -> Result<Vec<ScrapedRecord>, AdapterError> {
        parse_listing_html(&page.text(), ORIGIN_LABEL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONE_BLOCK: &str = r#"
        <html><body>
          <div class="dp-proyecto">
            <div class="dp-metadata">
              <span><b>Expediente:</b> 4321-D-2024 </span>
              <span><b>Fecha:</b> 12/03/2024</span>
            </div>
            <div class="dp-texto">
              LEY DE PRUEBA
            </div>
            <h5>FIRMANTES</h5>
            <table>
              <thead><tr><th>Firmante</th></tr></thead>
              <tbody><tr><td> GOMEZ, ANA </td></tr></tbody>
            </table>
          </div>
        </body></html>
    "#;

    #[test]
    fn single_signer_column_sets_author_only() {
        let records = parse_listing_html(ONE_BLOCK, "Diputados").unwrap();
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.case_id, "4321-D-2024");
        assert_eq!(rec.start_date, "12/03/2024");
        assert_eq!(rec.project_text, "LEY DE PRUEBA");
        assert_eq!(rec.author, "GOMEZ, ANA");
        assert_eq!(rec.party, NO_DATA);
        assert_eq!(rec.province, NO_DATA);
        assert_eq!(rec.committees, NO_DATA);
    }

    #[test]
    fn missing_labels_fall_back_to_no_data() {
        let html = r#"<div><div class="dp-metadata"><span>sin datos</span></div></div>"#;
        let records = parse_listing_html(html, "Diputados").unwrap();
        assert_eq!(records, vec![ScrapedRecord::no_data("Diputados")]);
    }

    #[test]
    fn unrecognised_page_yields_no_records() {
        let records = parse_listing_html("<html><body><p>mantenimiento</p></body></html>", "Diputados")
            .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn label_value_is_taken_after_last_colon() {
        let html = r#"<div><div class="dp-metadata"><span>Expediente: nro: 77-D-2023</span></div></div>"#;
        let records = parse_listing_html(html, "Diputados").unwrap();
        assert_eq!(records[0].case_id, "77-D-2023");
    }
}
