//! Parsing of the ka9q-web `/status` page
//!
//! The status page is a plain HTML table with one `<tr>` per receiver session. We only care about
//! the `<td>` cells; header cells (`<th>`) are ignored.

use std::{cell::RefCell, str::FromStr};

use lol_html::{RewriteStrSettings, element, errors::RewritingError, rewrite_str, text};

/// Audio-state token ka9q-web uses for a session with audio enabled.
const AUDIO_ENABLED: &str = "Enabled";

/// One session row from the status page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    /// Client address exactly as reported, usually `address:port`
    pub client: String,
    pub ssrc: i64,
    pub freq_range: String,
    /// Tuned frequency in Hz
    pub frequency: i64,
    /// Center frequency of the spectrum in Hz
    pub center_frequency: i64,
    pub bins: u32,
    pub bin_width: u32,
    /// Raw audio-state token
    pub audio: String,
}

impl Session {
    /// Whether the session is currently receiving audio.
    pub fn audio_active(&self) -> bool {
        self.audio == AUDIO_ENABLED
    }

    /// Build a session from a row, or `None` if the row has fewer than eight cells.
    ///
    /// Numeric cells that don't parse are read as 0 rather than discarding the row.
    fn from_row(row: &[String]) -> Option<Self> {
        let [client, ssrc, freq_range, frequency, center_frequency, bins, bin_width, audio, ..] =
            row
        else {
            return None;
        };
        Some(Session {
            client: client.clone(),
            ssrc: parse_number(ssrc),
            freq_range: freq_range.clone(),
            frequency: parse_number(frequency),
            center_frequency: parse_number(center_frequency),
            bins: parse_number(bins),
            bin_width: parse_number(bin_width),
            audio: audio.clone(),
        })
    }
}

/// Parse a numeric cell, reading anything other than an optional `-` followed by digits as 0.
fn parse_number<T: FromStr + Default>(cell: &str) -> T {
    if cell.starts_with('+') {
        return T::default();
    }
    cell.parse().unwrap_or_default()
}

/// The data cells of a status page, row by row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusTable {
    /// Decoded, trimmed cell text for every `<tr>` in the document
    rows: Vec<Vec<String>>,
}

impl StatusTable {
    /// Parse a status page.
    ///
    /// Only fails if the document can't be tokenized at all; garbled rows are kept and dealt with
    /// by [`StatusTable::sessions`].
    pub fn parse(html: &str) -> Result<Self, RewritingError> {
        let rows = RefCell::new(Vec::<Vec<String>>::new());

        rewrite_str(
            html,
            RewriteStrSettings {
                element_content_handlers: vec![
                    element!("tr", |_| {
                        rows.borrow_mut().push(Vec::new());
                        Ok(())
                    }),
                    element!("td", |_| {
                        if let Some(row) = rows.borrow_mut().last_mut() {
                            row.push(String::new());
                        }
                        Ok(())
                    }),
                    text!("td", |chunk| {
                        if let Some(cell) = rows.borrow_mut().last_mut().and_then(|r| r.last_mut())
                        {
                            cell.push_str(chunk.as_str());
                        }
                        Ok(())
                    }),
                ],
                ..RewriteStrSettings::new()
            },
        )?;

        let rows = rows
            .into_inner()
            .into_iter()
            .filter(|row| !row.is_empty())
            .map(|row| {
                row.iter()
                    .map(|cell| html_escape::decode_html_entities(cell.trim()).into_owned())
                    .collect()
            })
            .collect();

        Ok(StatusTable { rows })
    }

    /// Number of rows with at least one data cell, well-formed or not.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Iterate over the sessions in the table, skipping rows with fewer than eight cells.
    pub fn sessions(&self) -> impl Iterator<Item = Session> + '_ {
        self.rows.iter().filter_map(|row| Session::from_row(row))
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use super::{Session, StatusTable};

    /// Build a [`Session`] with the given client, ssrc and audio token and fixed tuning fields
    fn session(client: &str, ssrc: i64, audio: &str) -> Session {
        Session {
            client: client.to_owned(),
            ssrc,
            freq_range: "20m".to_owned(),
            frequency: 14_200_000,
            center_frequency: 14_000_000,
            bins: 64,
            bin_width: 10,
            audio: audio.to_owned(),
        }
    }

    #[test]
    fn test_parse_status_page() {
        let html = indoc! {r#"
            <html><body>
            <h1>ka9q-web status</h1>
            <table>
            <tr><th>Client</th><th>SSRC</th><th>Range</th><th>Frequency</th><th>Center</th><th>Bins</th><th>Bin width</th><th>Audio</th></tr>
            <tr><td>203.0.113.9:4000</td><td>55</td><td>20m</td><td>14200000</td><td>14000000</td><td>64</td><td>10</td><td>Enabled</td></tr>
            <tr>
              <td> [2001:db8::5]:6000 </td><td>56</td><td>20m</td><td>14200000</td>
              <td>14000000</td><td>64</td><td>10</td><td>Disabled</td>
            </tr>
            </table>
            </body></html>
        "#};

        let table = StatusTable::parse(html).unwrap();
        assert_eq!(table.row_count(), 2);
        assert_eq!(
            table.sessions().collect::<Vec<_>>(),
            vec![
                session("203.0.113.9:4000", 55, "Enabled"),
                session("[2001:db8::5]:6000", 56, "Disabled"),
            ]
        );
        assert!(table.sessions().next().unwrap().audio_active());
        assert!(!table.sessions().nth(1).unwrap().audio_active());
    }

    #[test]
    fn test_short_rows_are_skipped() {
        let html = indoc! {r#"
            <table>
            <tr><td>198.51.100.1:1</td><td>1</td><td>40m</td></tr>
            <tr><td>203.0.113.9:4000</td><td>55</td><td>20m</td><td>14200000</td><td>14000000</td><td>64</td><td>10</td><td>Enabled</td></tr>
            <tr><td>only one cell</td></tr>
            <tr><td>203.0.113.10:4000</td><td>57</td><td>20m</td><td>14200000</td><td>14000000</td><td>64</td><td>10</td><td>Enabled</td><td>extra</td></tr>
            </table>
        "#};

        let table = StatusTable::parse(html).unwrap();
        assert_eq!(table.row_count(), 4);
        let ssrcs = table.sessions().map(|s| s.ssrc).collect::<Vec<_>>();
        assert_eq!(ssrcs, vec![55, 57]);
    }

    #[test]
    fn test_bad_numbers_become_zero() {
        let html = indoc! {r#"
            <table>
            <tr><td>192.0.2.7:99</td><td>abc</td><td>20m</td><td>-14200000</td><td>14.0</td><td>-64</td><td></td><td>Enabled</td></tr>
            <tr><td>192.0.2.8:99</td><td>+5</td><td>20m</td><td>+14200000</td><td>+1</td><td>+64</td><td>+10</td><td>Enabled</td></tr>
            </table>
        "#};

        let table = StatusTable::parse(html).unwrap();
        let parsed = table.sessions().collect::<Vec<_>>();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].ssrc, 0);
        assert_eq!(parsed[0].frequency, -14_200_000);
        assert_eq!(parsed[0].center_frequency, 0);
        assert_eq!(parsed[0].bins, 0);
        assert_eq!(parsed[0].bin_width, 0);

        // An explicit plus sign isn't a number either
        let signed = &parsed[1];
        assert_eq!(
            (signed.ssrc, signed.frequency, signed.center_frequency),
            (0, 0, 0)
        );
        assert_eq!((signed.bins, signed.bin_width), (0, 0));
    }

    #[test]
    fn test_entities_are_decoded() {
        let html = "<table><tr><td>host.example</td><td>1</td><td>2m &amp; 70cm</td>\
                    <td>1</td><td>1</td><td>1</td><td>1</td><td>Enabled</td></tr></table>";

        let table = StatusTable::parse(html).unwrap();
        assert_eq!(table.sessions().next().unwrap().freq_range, "2m & 70cm");
    }

    #[test]
    fn test_no_table() {
        let table = StatusTable::parse("<html><body>ka9q-web is starting</body></html>").unwrap();
        assert_eq!(table.row_count(), 0);
        assert_eq!(table.sessions().count(), 0);
    }
}
