//! Endpoint catalog of the kindergarten API.
//!
//! Each function returns a fresh descriptor; they are cheap to build and can
//! be stored in a `static` `LazyLock` by applications that prefer to.
//!
//! | tag | provided by | invalidated by |
//! |---|---|---|
//! | `School:<id>` | [`school`], [`search_schools`], [`my_school`] | every school mutation, [`create_review`], [`moderate_review`] |
//! | `School:LIST` | [`search_schools`] | [`publish_school`] |
//! | `School:MINE` | [`my_school`] | [`save_draft`] |
//! | `School:PENDING` | [`pending_schools`] | [`submit_school`], [`approve_school`], [`reject_school`] |
//! | `Review:school-<id>` | [`school_reviews`] | [`create_review`], [`moderate_review`] |
//! | `Review:REPORTED` | [`reported_reviews`] | [`moderate_review`] |
//! | `User:me` | [`me`] | [`login`] |
//! | `User:LIST` | [`users`] | [`update_user_role`], [`delete_user`] |

use crate::endpoint::{MutationEndpoint, QueryEndpoint, RequestSpec, Tag};

use super::models::{
    LoginRequest, LoginResponse, Moderation, NewReview, Page, PageRequest, Rejection, Review,
    RoleChange, School, SchoolDraft, SchoolId, SchoolSummary, SearchParams, User, UserId,
};

pub const SCHOOL: &str = "School";
pub const REVIEW: &str = "Review";
pub const USER: &str = "User";

pub fn school_tag(id: SchoolId) -> Tag {
    Tag::with_id(SCHOOL, id)
}

pub fn school_list_tag() -> Tag {
    Tag::with_id(SCHOOL, "LIST")
}

pub fn school_reviews_tag(id: SchoolId) -> Tag {
    Tag::with_id(REVIEW, format!("school-{id}"))
}

fn user_tag(id: UserId) -> Tag {
    Tag::with_id(USER, id)
}

// Auth

/// `POST /auth/login`. Stores the returned credentials on success.
pub fn login() -> MutationEndpoint<LoginRequest, LoginResponse> {
    MutationEndpoint::<LoginRequest, LoginResponse>::new("login", |request| {
        RequestSpec::post("/auth/login").json(request).skip_reauth()
    })
    .establishes_session(LoginResponse::credentials)
    .invalidates(|_, _| vec![Tag::with_id(USER, "me")])
}

/// `POST /auth/logout`. Clears credentials, persisted state and the cache.
///
/// Prefer [`ApiClient::logout`](crate::ApiClient::logout), which clears the
/// local session even when the server call fails.
pub fn logout() -> MutationEndpoint<(), ()> {
    MutationEndpoint::<(), ()>::new("logout", |()| {
        RequestSpec::post("/auth/logout").skip_reauth()
    })
    .clears_session()
}

/// `GET /auth/me`.
pub fn me() -> QueryEndpoint<(), User> {
    QueryEndpoint::<(), User>::new("me", |()| RequestSpec::get("/auth/me"))
        .provides(|user: &User, ()| vec![Tag::with_id(USER, "me"), user_tag(user.id)])
}

// Public

/// `GET /schools`.
pub fn search_schools() -> QueryEndpoint<SearchParams, Page<SchoolSummary>> {
    QueryEndpoint::<SearchParams, Page<SchoolSummary>>::new("searchSchools", |params| {
        RequestSpec::get("/schools")
            .query_opt("keyword", params.keyword.as_deref())
            .query_opt("region", params.region.as_deref())
            .query("page", params.page)
            .query("size", params.size)
    })
    .provides(|page: &Page<SchoolSummary>, _| {
        std::iter::once(school_list_tag())
            .chain(page.content.iter().map(|school| school_tag(school.id)))
            .collect()
    })
}

/// `GET /schools/{id}`.
pub fn school() -> QueryEndpoint<SchoolId, School> {
    QueryEndpoint::<SchoolId, School>::new("school", |id| {
        RequestSpec::get(format!("/schools/{id}"))
    })
    .provides(|_, id| vec![school_tag(*id)])
}

/// `GET /schools/{id}/reviews`.
pub fn school_reviews() -> QueryEndpoint<SchoolId, Vec<Review>> {
    QueryEndpoint::<SchoolId, Vec<Review>>::new("schoolReviews", |id| {
        RequestSpec::get(format!("/schools/{id}/reviews"))
    })
    .provides(|reviews: &Vec<Review>, id| {
        let mut tags = vec![Tag::with_id(REVIEW, "LIST"), school_reviews_tag(*id)];
        tags.extend(reviews.iter().map(|review| Tag::with_id(REVIEW, review.id)));
        tags
    })
}

/// `POST /schools/{id}/reviews`. Refreshes the review list and the school's
/// average rating.
pub fn create_review() -> MutationEndpoint<NewReview, Review> {
    MutationEndpoint::<NewReview, Review>::new("createReview", |review| {
        RequestSpec::post(format!("/schools/{}/reviews", review.school_id)).json(review)
    })
    .invalidates(|review, _| {
        vec![
            school_reviews_tag(review.school_id),
            school_tag(review.school_id),
        ]
    })
}

// Owner

/// `GET /owner/school`: the school owned by the current user.
pub fn my_school() -> QueryEndpoint<(), School> {
    QueryEndpoint::<(), School>::new("mySchool", |()| RequestSpec::get("/owner/school"))
        .provides(|school: &School, ()| vec![school_tag(school.id), Tag::with_id(SCHOOL, "MINE")])
}

/// `PUT /owner/school`: saves the owner's draft.
pub fn save_draft() -> MutationEndpoint<SchoolDraft, School> {
    MutationEndpoint::<SchoolDraft, School>::new("saveDraft", |draft| {
        RequestSpec::put("/owner/school").json(draft)
    })
    .invalidates(|_, school: &School| vec![Tag::with_id(SCHOOL, "MINE"), school_tag(school.id)])
}

/// `POST /owner/school/{id}/submit`: hands the draft to the admins.
pub fn submit_school() -> MutationEndpoint<SchoolId, School> {
    MutationEndpoint::<SchoolId, School>::new("submitSchool", |id| {
        RequestSpec::post(format!("/owner/school/{id}/submit"))
    })
    .invalidates(|id, _| vec![school_tag(*id), Tag::with_id(SCHOOL, "PENDING")])
}

/// `POST /owner/school/{id}/publish`: makes an approved school public.
pub fn publish_school() -> MutationEndpoint<SchoolId, School> {
    MutationEndpoint::<SchoolId, School>::new("publishSchool", |id| {
        RequestSpec::post(format!("/owner/school/{id}/publish"))
    })
    .invalidates(|id, _| vec![school_tag(*id), school_list_tag()])
}

// Admin

/// `GET /admin/users`.
pub fn users() -> QueryEndpoint<PageRequest, Page<User>> {
    QueryEndpoint::<PageRequest, Page<User>>::new("users", |request| {
        RequestSpec::get("/admin/users")
            .query("page", request.page)
            .query("size", request.size)
    })
    .provides(|page: &Page<User>, _| {
        std::iter::once(Tag::with_id(USER, "LIST"))
            .chain(page.content.iter().map(|user| user_tag(user.id)))
            .collect()
    })
}

/// `PATCH /admin/users/{id}/role`.
pub fn update_user_role() -> MutationEndpoint<RoleChange, User> {
    MutationEndpoint::<RoleChange, User>::new("updateUserRole", |change| {
        RequestSpec::patch(format!("/admin/users/{}/role", change.user_id))
            .json(&serde_json::json!({ "role": change.role }))
    })
    .invalidates(|change, _| vec![user_tag(change.user_id), Tag::with_id(USER, "LIST")])
}

/// `DELETE /admin/users/{id}`.
pub fn delete_user() -> MutationEndpoint<UserId, ()> {
    MutationEndpoint::<UserId, ()>::new("deleteUser", |id| {
        RequestSpec::delete(format!("/admin/users/{id}"))
    })
    .invalidates(|id, ()| vec![user_tag(*id), Tag::with_id(USER, "LIST")])
}

/// `GET /admin/schools/pending`: the approval queue.
pub fn pending_schools() -> QueryEndpoint<(), Vec<SchoolSummary>> {
    QueryEndpoint::<(), Vec<SchoolSummary>>::new("pendingSchools", |()| {
        RequestSpec::get("/admin/schools/pending")
    })
    .provides(|schools, ()| {
        std::iter::once(Tag::with_id(SCHOOL, "PENDING"))
            .chain(schools.iter().map(|school| school_tag(school.id)))
            .collect()
    })
}

/// `POST /admin/schools/{id}/approve`.
pub fn approve_school() -> MutationEndpoint<SchoolId, School> {
    MutationEndpoint::<SchoolId, School>::new("approveSchool", |id| {
        RequestSpec::post(format!("/admin/schools/{id}/approve"))
    })
    .invalidates(|id, _| vec![school_tag(*id), Tag::with_id(SCHOOL, "PENDING")])
}

/// `POST /admin/schools/{id}/reject`.
pub fn reject_school() -> MutationEndpoint<Rejection, School> {
    MutationEndpoint::<Rejection, School>::new("rejectSchool", |rejection| {
        RequestSpec::post(format!("/admin/schools/{}/reject", rejection.school_id))
            .json(&serde_json::json!({ "reason": rejection.reason }))
    })
    .invalidates(|rejection, _| {
        vec![
            school_tag(rejection.school_id),
            Tag::with_id(SCHOOL, "PENDING"),
        ]
    })
}

/// `GET /admin/reviews/reported`: the moderation queue.
pub fn reported_reviews() -> QueryEndpoint<(), Vec<Review>> {
    QueryEndpoint::<(), Vec<Review>>::new("reportedReviews", |()| {
        RequestSpec::get("/admin/reviews/reported")
    })
    .provides(|reviews, ()| {
        std::iter::once(Tag::with_id(REVIEW, "REPORTED"))
            .chain(reviews.iter().map(|review| Tag::with_id(REVIEW, review.id)))
            .collect()
    })
}

/// `POST /admin/reviews/{id}/moderate`.
pub fn moderate_review() -> MutationEndpoint<Moderation, ()> {
    MutationEndpoint::<Moderation, ()>::new("moderateReview", |moderation| {
        RequestSpec::post(format!("/admin/reviews/{}/moderate", moderation.review_id))
            .json(&serde_json::json!({ "action": moderation.action }))
    })
    .invalidates(|moderation, ()| {
        vec![
            Tag::with_id(REVIEW, moderation.review_id),
            Tag::with_id(REVIEW, "REPORTED"),
            school_reviews_tag(moderation.school_id),
            school_tag(moderation.school_id),
        ]
    })
}
