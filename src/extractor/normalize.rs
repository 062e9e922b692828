//! Turn a detail payload into a canonical [`Record`].

use super::client::{Attachment, PostDetail, SourceLink};
use crate::types::{FileRef, Record};
use std::collections::HashSet;

/// Build the record for `detail` as found on the listing page at `offset`
///
/// Each of the post's own files (`post.file`, then `post.attachments`) is resolved
/// to `<server>/data<path>` by looking its path up among the previews, the top-level
/// attachments and videos, and the post's attachments. Entries without a match or
/// without a server are skipped; repeated URLs keep their first occurrence.
pub fn normalize(
    detail: &PostDetail,
    link: &SourceLink,
    page: u64,
    offset: u64,
) -> Record {
    let post = &detail.post;
    let candidates: Vec<&Attachment> = detail
        .previews
        .iter()
        .chain(&detail.attachments)
        .chain(&detail.videos)
        .chain(&post.attachments)
        .collect();

    let mut files = Vec::new();
    let mut seen = HashSet::new();
    for entry in post.file.iter().chain(&post.attachments) {
        let Some(path) = entry.path.as_deref().filter(|p| !p.is_empty()) else {
            continue;
        };
        let Some(matched) = candidates
            .iter()
            .find(|c| c.path.as_deref() == Some(path))
        else {
            tracing::debug!(post_id = %post.id, path = %path, "No server entry for file");
            continue;
        };
        let Some(server) = matched.server.as_deref().filter(|s| !s.is_empty()) else {
            tracing::warn!(post_id = %post.id, path = %path, "Malformed file entry, missing server");
            continue;
        };

        let url = format!("{}/data{}", server.trim_end_matches('/'), path);
        if seen.insert(url.clone()) {
            files.push(FileRef::new(entry.name.clone().unwrap_or_default(), url));
        }
    }

    let user = if post.user.is_empty() {
        link.user.clone()
    } else {
        post.user.clone()
    };
    let service = if post.service.is_empty() {
        link.service.clone()
    } else {
        post.service.clone()
    };

    Record {
        link: format!(
            "{}/{}/user/{}/post/{}",
            link.server_base(),
            service,
            user,
            post.id
        ),
        id: post.id.clone(),
        user,
        service,
        title: post.title.clone(),
        page,
        offset,
        files,
    }
}
