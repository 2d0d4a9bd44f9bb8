//! Member list and member-data parsing

use crate::error::PipelineError;
use crate::types::{Member, MemberId, Page};
use std::collections::HashSet;
use std::path::Path;

/// Read the list file: one member id per line
///
/// Blank lines are skipped; lines that are not integers are skipped with a warning.
pub fn read_list_file(path: &Path) -> Result<Vec<MemberId>, PipelineError> {
    let text = std::fs::read_to_string(path).map_err(|e| PipelineError::ListFileUnreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(parse_list(&text))
}

/// Parse list file contents
pub fn parse_list(text: &str) -> Vec<MemberId> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match line.parse::<MemberId>() {
            Ok(id) => Some(id),
            Err(_) => {
                tracing::warn!(line, "skipping invalid member id");
                None
            }
        })
        .collect()
}

/// Read and parse the member-data dump
pub fn read_member_data(path: &Path, per_page: u32) -> Result<Vec<Member>, PipelineError> {
    if !path.exists() {
        return Err(PipelineError::MemberDataMissing {
            path: path.to_path_buf(),
        });
    }
    let text =
        std::fs::read_to_string(path).map_err(|e| PipelineError::MemberDataUnreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    Ok(parse_member_data(&text, per_page))
}

/// Parse `memberId,totalItems,...` lines into members with derived pages
///
/// Members keep the order of their first line. Lines that do not parse and
/// members without items are skipped. A repeated member keeps the totals of
/// its first line; later lines for it are ignored rather than merged, so
/// their pages are never added to the first line's pages.
pub fn parse_member_data(text: &str, per_page: u32) -> Vec<Member> {
    let per_page = per_page.max(1);
    let mut seen = HashSet::new();
    let mut members = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split(',');
        let (Some(id), Some(total)) = (fields.next(), fields.next()) else {
            continue;
        };
        let (Ok(id), Ok(total)) = (id.parse::<MemberId>(), total.trim().parse::<i64>()) else {
            continue;
        };

        if total <= 0 {
            tracing::warn!(member = %id, "member has no items, skipping");
            continue;
        }
        if !seen.insert(id) {
            tracing::warn!(member = %id, "member listed more than once, keeping the first entry");
            continue;
        }

        let total = u32::try_from(total).unwrap_or(u32::MAX);
        let pages = build_pages(id, total, per_page);
        tracing::debug!(member = %id, items = total, pages = pages.len(), "member parsed");
        members.push(Member {
            id,
            total_items: total,
            pages,
        });
    }
    members
}

/// Number of pages for `total` items
///
/// Always one more than the number of full pages, so an exact multiple
/// still gets a trailing page.
pub fn page_count(total: u32, per_page: u32) -> u32 {
    let per_page = per_page.max(1);
    ((total - total % per_page) / per_page).saturating_add(1)
}

/// Pages of a member, page 1 first, with reverse file indices
pub fn build_pages(member: MemberId, total: u32, per_page: u32) -> Vec<Page> {
    let count = page_count(total, per_page);
    (1..=count)
        .map(|number| Page {
            member,
            number,
            file_index: count - number + 1,
        })
        .collect()
}
