//! hCalendar microformat reading and rendering.

use chrono_tz::Tz;
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};

use super::{base, AbstractEvent, AbstractLocation, ParseError, ParseOptions, SourceParser};
use crate::models::{Event, Venue};

static VEVENT: Lazy<Selector> = Lazy::new(|| Selector::parse(".vevent").expect("vevent selector"));
static SUMMARY: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".summary").expect("hcal summary"));
static DESCRIPTION: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".description").expect("hcal description"));
static URL: Lazy<Selector> = Lazy::new(|| Selector::parse(".url").expect("hcal url"));
static DTSTART: Lazy<Selector> = Lazy::new(|| Selector::parse(".dtstart").expect("hcal dtstart"));
static DTEND: Lazy<Selector> = Lazy::new(|| Selector::parse(".dtend").expect("hcal dtend"));
static LOCATION: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".location").expect("hcal location"));
static ADDRESS: Lazy<Selector> = Lazy::new(|| Selector::parse(".adr").expect("hcal address"));
static TAGS: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".category, [rel=tag]").expect("hcal tag selector"));

pub struct HCalendar;

impl SourceParser for HCalendar {
    fn label(&self) -> &'static str {
        "hCalendar"
    }

    fn matches(&self, content: &str) -> bool {
        content.contains("vevent")
    }

    fn parse(&self, content: &str, options: &ParseOptions) -> Result<Vec<AbstractEvent>, ParseError> {
        let document = Html::parse_document(content);
        let events = document
            .select(&VEVENT)
            .filter_map(|node| read_vevent(node, options))
            .collect();
        Ok(events)
    }
}

fn read_vevent(node: ElementRef<'_>, options: &ParseOptions) -> Option<AbstractEvent> {
    let tz = options.tz;
    let title = base::first_text(&node, &SUMMARY)?;
    let start_time = read_time(&node, &DTSTART, tz)?;
    let end_time = read_time(&node, &DTEND, tz).filter(|end| *end >= start_time);

    let url = base::first_attr(&node, &URL, "href")
        .or_else(|| base::first_text(&node, &URL))
        .filter(|href| !href.trim().is_empty())
        .map(|href| {
            base::absolute_url(options.base_url.as_deref(), Some(href.clone())).unwrap_or(href)
        });

    let location = node.select(&LOCATION).next().and_then(|loc| {
        let title = base::inner_text(loc);
        if title.is_empty() {
            return None;
        }
        Some(AbstractLocation {
            title,
            address: base::first_text(&node, &ADDRESS),
        })
    });

    let mut tags: Vec<String> = Vec::new();
    for tag in node.select(&TAGS).map(base::inner_text) {
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    }

    Some(AbstractEvent {
        title,
        description: base::first_text(&node, &DESCRIPTION),
        start_time,
        end_time,
        url,
        location,
        tags,
    })
}

/// Times come from the `title` attribute (abbr pattern), `datetime`
/// (`<time>`), or the element text, in that order.
fn read_time(node: &ElementRef<'_>, selector: &Selector, tz: Tz) -> Option<chrono::DateTime<chrono::Utc>> {
    let element = node.select(selector).next()?;
    let value = element.value();
    [value.attr("title"), value.attr("datetime")]
        .into_iter()
        .flatten()
        .map(str::to_string)
        .chain(std::iter::once(base::inner_text(element)))
        .find_map(|candidate| base::parse_timestamp(&candidate, tz))
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Renders one event as an hCalendar `div.vevent`.
pub fn to_hcal(event: &Event, venue: Option<&Venue>) -> String {
    let mut html = String::from("<div class=\"vevent\">\n");
    let title = escape_html(&event.title);
    match event.url {
        Some(ref url) => html.push_str(&format!(
            "  <a class=\"url summary\" href=\"{}\">{title}</a>\n",
            escape_html(url)
        )),
        None => html.push_str(&format!("  <span class=\"summary\">{title}</span>\n")),
    }

    let start = event.start_time.to_rfc3339();
    html.push_str(&format!(
        "  <abbr class=\"dtstart\" title=\"{start}\">{}</abbr>\n",
        event.start_time.format("%A, %B %-d, %Y %H:%M UTC")
    ));
    if let Some(end) = event.end_time {
        html.push_str(&format!(
            "  <abbr class=\"dtend\" title=\"{}\">{}</abbr>\n",
            end.to_rfc3339(),
            end.format("%A, %B %-d, %Y %H:%M UTC")
        ));
    }

    if let Some(venue) = venue {
        html.push_str(&format!(
            "  <span class=\"location\">{}</span>\n",
            escape_html(&venue.title)
        ));
        if let Some(ref address) = venue.address {
            html.push_str(&format!("  <span class=\"adr\">{}</span>\n", escape_html(address)));
        }
    }
    if let Some(ref description) = event.description {
        html.push_str(&format!(
            "  <div class=\"description\">{}</div>\n",
            escape_html(description)
        ));
    }
    for tag in &event.tags {
        html.push_str(&format!(
            "  <a rel=\"tag\" class=\"category\">{}</a>\n",
            escape_html(tag)
        ));
    }
    html.push_str("</div>\n");
    html
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const WEB2_CONFERENCE: &str = r#"<html><body>
<div class="vevent">
  <a class="url" href="http://www.web2con.com/">http://www.web2con.com/</a>
  <span class="summary">Web 2.0 Conference</span>:
  <abbr class="dtstart" title="2007-10-05">October 5</abbr>-
  <abbr class="dtend" title="2007-10-20">19</abbr>,
  at the <span class="location">Argent Hotel, San Francisco, CA</span>
</div>
</body></html>"#;

    fn parse(content: &str) -> Vec<AbstractEvent> {
        HCalendar
            .parse(content, &ParseOptions::default())
            .expect("parse hcal")
    }

    #[test]
    fn reads_the_microformat_example() {
        assert!(HCalendar.matches(WEB2_CONFERENCE));
        let events = parse(WEB2_CONFERENCE);
        assert_eq!(events.len(), 1);

        let event = &events[0];
        assert_eq!(event.title, "Web 2.0 Conference");
        assert_eq!(event.url.as_deref(), Some("http://www.web2con.com/"));
        assert_eq!(
            event.start_time,
            Utc.with_ymd_and_hms(2007, 10, 5, 0, 0, 0).single().expect("time")
        );
        assert_eq!(
            event.end_time,
            Utc.with_ymd_and_hms(2007, 10, 20, 0, 0, 0).single()
        );
        assert_eq!(
            event.location.as_ref().map(|l| l.title.as_str()),
            Some("Argent Hotel, San Francisco, CA")
        );
    }

    #[test]
    fn relative_links_resolve_against_the_page() {
        let html = r#"<div class="vevent"><a class="url summary" href="/events/9">Swap meet</a><abbr class="dtstart" title="2008-01-02">Jan 2</abbr></div>"#;
        let options = ParseOptions {
            base_url: Some("http://example.com/list".to_string()),
            ..ParseOptions::default()
        };
        let events = HCalendar.parse(html, &options).expect("parse hcal");
        assert_eq!(events[0].url.as_deref(), Some("http://example.com/events/9"));

        let events = parse(html);
        assert_eq!(events[0].url.as_deref(), Some("/events/9"));
    }

    #[test]
    fn skips_entries_without_a_start() {
        let html = r#"<div class="vevent"><span class="summary">No date</span></div>
<div class="vevent"><span class="summary">Dated</span><time class="dtstart" datetime="2008-01-02T10:00:00Z">Jan 2</time><a rel="tag">music</a><a rel="tag">music</a></div>"#;
        let events = parse(html);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title, "Dated");
        assert_eq!(events[0].tags, vec!["music".to_string()]);
    }

    #[test]
    fn rendered_event_reads_back() {
        let start = Utc.with_ymd_and_hms(2008, 4, 12, 19, 0, 0).single().expect("time");
        let event = Event {
            id: 7,
            title: "Jazz & Blues".to_string(),
            description: Some("<b>loud</b>".to_string()),
            url: Some("http://example.com/jazz".to_string()),
            start_time: start,
            end_time: None,
            venue_id: Some(3),
            source_id: None,
            duplicate_of_id: None,
            tags: vec!["music".to_string()],
            created_at: start,
            updated_at: start,
        };
        let venue = Venue {
            id: 3,
            title: "Crystal Ballroom".to_string(),
            description: None,
            address: Some("1332 W Burnside".to_string()),
            url: None,
            duplicate_of_id: None,
            source_id: None,
            created_at: start,
            updated_at: start,
        };

        let html = to_hcal(&event, Some(&venue));
        assert!(html.contains("Jazz &amp; Blues"));
        assert!(html.contains("&lt;b&gt;loud&lt;/b&gt;"));

        let events = parse(&html);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title, "Jazz & Blues");
        assert_eq!(events[0].start_time, start);
        assert_eq!(events[0].url.as_deref(), Some("http://example.com/jazz"));
        assert_eq!(events[0].description.as_deref(), Some("<b>loud</b>"));
        assert_eq!(events[0].tags, vec!["music".to_string()]);
        let location = events[0].location.as_ref().expect("location");
        assert_eq!(location.title, "Crystal Ballroom");
        assert_eq!(location.address.as_deref(), Some("1332 W Burnside"));
    }
}
