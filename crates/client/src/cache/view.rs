use hyperlocal_shared::{Comment, CommentId, Page, Post, PostId, VoteValue};

/// Identifies one cached screen of data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ViewKey {
    NearbyFeed,
    MyPosts,
    PostDetail(PostId),
    /// Top-level comments of a post, each carrying its reply preview.
    Comments(PostId),
    CommentDetail(CommentId),
    Replies(CommentId),
}

/// Cached data behind a [ViewKey]. Lists keep every page loaded so far, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum View {
    Posts(Vec<Page<Post>>),
    Post(Post),
    Comments(Vec<Page<Comment>>),
    Comment(Comment),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityRef {
    Post(PostId),
    Comment(CommentId),
}

/// The server-maintained fields of one cached entity copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregates {
    pub score: i64,
    pub my_vote: Option<VoteValue>,
    /// `comments_count` for posts, `replies_count` for comments.
    pub children: i64,
}

/// A comment taken out of a list view and where it sat.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Removed {
    page: usize,
    /// Set when the comment sat in this parent's reply preview.
    parent: Option<CommentId>,
    index: usize,
    comment: Comment,
}

pub(crate) trait Cached {
    fn entity(&self) -> EntityRef;
    fn aggregates(&self) -> Aggregates;
    fn set_aggregates(&mut self, aggregates: Aggregates);
}

impl Cached for Post {
    fn entity(&self) -> EntityRef {
        EntityRef::Post(self.id)
    }

    fn aggregates(&self) -> Aggregates {
        Aggregates {
            score: self.score,
            my_vote: self.my_vote,
            children: self.comments_count,
        }
    }

    fn set_aggregates(&mut self, aggregates: Aggregates) {
        self.score = aggregates.score;
        self.my_vote = aggregates.my_vote;
        self.comments_count = aggregates.children;
    }
}

impl Cached for Comment {
    fn entity(&self) -> EntityRef {
        EntityRef::Comment(self.id)
    }

    fn aggregates(&self) -> Aggregates {
        Aggregates {
            score: self.score,
            my_vote: self.my_vote,
            children: self.replies_count,
        }
    }

    fn set_aggregates(&mut self, aggregates: Aggregates) {
        self.score = aggregates.score;
        self.my_vote = aggregates.my_vote;
        self.replies_count = aggregates.children;
    }
}

fn patch<T: Cached>(
    item: &mut T,
    target: EntityRef,
    f: &mut dyn FnMut(Aggregates) -> Aggregates,
) -> usize {
    if item.entity() != target {
        return 0;
    }
    let next = f(item.aggregates());
    item.set_aggregates(next);
    1
}

fn patch_comment(
    comment: &mut Comment,
    target: EntityRef,
    f: &mut dyn FnMut(Aggregates) -> Aggregates,
) -> usize {
    let mut hits = patch(comment, target, f);
    for reply in &mut comment.replies {
        hits += patch_comment(reply, target, f);
    }
    hits
}

fn take_reply(parent: &mut Comment, id: CommentId, page: usize) -> Option<Removed> {
    let index = parent.replies.iter().position(|reply| reply.id == id)?;
    Some(Removed {
        page,
        parent: Some(parent.id),
        index,
        comment: parent.replies.remove(index),
    })
}

fn collect_comment(comment: &Comment, target: EntityRef, out: &mut Vec<Aggregates>) {
    if comment.entity() == target {
        out.push(comment.aggregates());
    }
    for reply in &comment.replies {
        collect_comment(reply, target, out);
    }
}

impl View {
    /// Rewrite the aggregates of every copy of `target` in this view, including replies nested
    /// in previews. Returns how many copies were touched.
    pub fn update(
        &mut self,
        target: EntityRef,
        f: &mut dyn FnMut(Aggregates) -> Aggregates,
    ) -> usize {
        let mut hits = 0;
        match self {
            View::Posts(pages) => {
                for post in pages.iter_mut().flat_map(|page| page.items.iter_mut()) {
                    hits += patch(post, target, f);
                }
            }
            View::Post(post) => hits += patch(post, target, f),
            View::Comments(pages) => {
                for comment in pages.iter_mut().flat_map(|page| page.items.iter_mut()) {
                    hits += patch_comment(comment, target, f);
                }
            }
            View::Comment(comment) => hits += patch_comment(comment, target, f),
        }
        hits
    }

    /// Aggregates of every copy of `target` in this view.
    pub fn copies(&self, target: EntityRef) -> Vec<Aggregates> {
        let mut out = Vec::new();
        match self {
            View::Posts(pages) => out.extend(
                pages
                    .iter()
                    .flat_map(|page| page.items.iter())
                    .filter(|post| post.entity() == target)
                    .map(|post| post.aggregates()),
            ),
            View::Post(post) if post.entity() == target => out.push(post.aggregates()),
            View::Post(_) => {}
            View::Comments(pages) => {
                for comment in pages.iter().flat_map(|page| page.items.iter()) {
                    collect_comment(comment, target, &mut out);
                }
            }
            View::Comment(comment) => collect_comment(comment, target, &mut out),
        }
        out
    }

    /// Take a comment out of this view, whether listed directly or inside a reply preview.
    pub(crate) fn take_comment(&mut self, id: CommentId) -> Vec<Removed> {
        let mut removed = Vec::new();
        match self {
            View::Comments(pages) => {
                for (page_index, page) in pages.iter_mut().enumerate() {
                    if let Some(index) = page.items.iter().position(|comment| comment.id == id) {
                        removed.push(Removed {
                            page: page_index,
                            parent: None,
                            index,
                            comment: page.items.remove(index),
                        });
                    }
                    for comment in &mut page.items {
                        removed.extend(take_reply(comment, id, page_index));
                    }
                }
            }
            View::Comment(comment) => removed.extend(take_reply(comment, id, 0)),
            View::Posts(_) | View::Post(_) => {}
        }
        removed
    }

    /// Put a taken comment back where it was. Nothing happens when the view already holds the
    /// comment again or the page or parent it sat in is gone.
    pub(crate) fn restore_comment(&mut self, removed: Removed) -> bool {
        if !self.copies(removed.comment.entity()).is_empty() {
            return false;
        }
        let list = match (self, removed.parent) {
            (View::Comments(pages), None) => {
                pages.get_mut(removed.page).map(|page| &mut page.items)
            }
            (View::Comments(pages), Some(parent)) => pages
                .get_mut(removed.page)
                .and_then(|page| page.items.iter_mut().find(|comment| comment.id == parent))
                .map(|comment| &mut comment.replies),
            (View::Comment(comment), Some(parent)) if comment.id == parent => {
                Some(&mut comment.replies)
            }
            _ => None,
        };
        let Some(list) = list else {
            return false;
        };
        let index = removed.index.min(list.len());
        list.insert(index, removed.comment);
        true
    }

    /// Append the pages of `more` when both are lists of the same kind, otherwise replace.
    pub(crate) fn extend(&mut self, more: View) {
        match (self, more) {
            (View::Posts(pages), View::Posts(more)) => pages.extend(more),
            (View::Comments(pages), View::Comments(more)) => pages.extend(more),
            (current, more) => *current = more,
        }
    }

    pub fn posts(&self) -> Vec<&Post> {
        match self {
            View::Posts(pages) => pages.iter().flat_map(|page| page.items.iter()).collect(),
            View::Post(post) => vec![post],
            _ => Vec::new(),
        }
    }

    pub fn comments(&self) -> Vec<&Comment> {
        match self {
            View::Comments(pages) => pages.iter().flat_map(|page| page.items.iter()).collect(),
            View::Comment(comment) => vec![comment],
            _ => Vec::new(),
        }
    }

    /// Whether the last loaded page says more items exist.
    pub fn has_more(&self) -> bool {
        match self {
            View::Posts(pages) => pages.last().is_some_and(|page| page.has_more),
            View::Comments(pages) => pages.last().is_some_and(|page| page.has_more),
            _ => false,
        }
    }

    /// Cursor for the next page of a list view.
    pub fn next_cursor(&self) -> Option<i64> {
        match self {
            View::Posts(pages) => pages.last()?.next_cursor(|post| post.id.0),
            View::Comments(pages) => pages.last()?.next_cursor(|comment| comment.id.0),
            _ => None,
        }
    }
}
