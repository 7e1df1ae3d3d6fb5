use crate::database::error::DatabaseResult;
use crate::database::gateway::DocumentGateway;
use crate::database::query::{FilterOperator, QueryOptions, SearchFilter};
use crate::model::{Collection, NewStaff, NewUser, Staff, StaffPatch, User, UserPatch};
use crate::util::subscribe::Unsubscribe;

/// Upper bound appended to a search term to turn `>=`/`<=` into a prefix match.
const PREFIX_SENTINEL: char = '\u{f8ff}';

/// Typed access to the `users` collection.
#[derive(Clone, Debug)]
pub struct UserRepository {
    gateway: DocumentGateway,
}

impl UserRepository {
    pub fn new(gateway: DocumentGateway) -> Self {
        Self { gateway }
    }

    fn collection(&self) -> &'static str {
        Collection::Users.as_str()
    }

    pub async fn create_user(&self, user: &NewUser) -> DatabaseResult<String> {
        self.gateway.create(self.collection(), user).await
    }

    pub async fn get_user(&self, id: &str) -> DatabaseResult<Option<User>> {
        self.gateway.read(self.collection(), id).await
    }

    pub async fn update_user(&self, id: &str, patch: &UserPatch) -> DatabaseResult<()> {
        self.gateway.update(self.collection(), id, patch).await
    }

    pub async fn delete_user(&self, id: &str) -> DatabaseResult<()> {
        self.gateway.delete(self.collection(), id).await
    }

    pub async fn list_users(&self, options: &QueryOptions) -> DatabaseResult<Vec<User>> {
        self.gateway.list(self.collection(), options).await
    }

    /// Residents whose name starts with `term`.
    pub async fn search_users(&self, term: &str) -> DatabaseResult<Vec<User>> {
        self.gateway
            .search(self.collection(), name_prefix_filters(term))
            .await
    }

    pub fn subscribe_to_users<F>(&self, options: &QueryOptions, callback: F) -> Unsubscribe
    where
        F: Fn(Vec<User>) + Send + Sync + 'static,
    {
        self.gateway.subscribe(self.collection(), options, callback)
    }

    pub fn subscribe_to_user<F>(&self, id: &str, callback: F) -> Unsubscribe
    where
        F: Fn(Option<User>) + Send + Sync + 'static,
    {
        self.gateway
            .subscribe_to_document(self.collection(), id, callback)
    }
}

/// Typed access to the `staff` collection.
#[derive(Clone, Debug)]
pub struct StaffRepository {
    gateway: DocumentGateway,
}

impl StaffRepository {
    pub fn new(gateway: DocumentGateway) -> Self {
        Self { gateway }
    }

    fn collection(&self) -> &'static str {
        Collection::Staff.as_str()
    }

    pub async fn create_staff(&self, staff: &NewStaff) -> DatabaseResult<String> {
        self.gateway.create(self.collection(), staff).await
    }

    pub async fn get_staff(&self, id: &str) -> DatabaseResult<Option<Staff>> {
        self.gateway.read(self.collection(), id).await
    }

    pub async fn update_staff(&self, id: &str, patch: &StaffPatch) -> DatabaseResult<()> {
        self.gateway.update(self.collection(), id, patch).await
    }

    pub async fn delete_staff(&self, id: &str) -> DatabaseResult<()> {
        self.gateway.delete(self.collection(), id).await
    }

    pub async fn list_staff(&self, options: &QueryOptions) -> DatabaseResult<Vec<Staff>> {
        self.gateway.list(self.collection(), options).await
    }

    pub async fn search_staff(&self, term: &str) -> DatabaseResult<Vec<Staff>> {
        self.gateway
            .search(self.collection(), name_prefix_filters(term))
            .await
    }

    pub async fn get_active_staff(&self) -> DatabaseResult<Vec<Staff>> {
        self.gateway
            .search(
                self.collection(),
                vec![SearchFilter::new("isActive", FilterOperator::Equal, true)],
            )
            .await
    }

    pub fn subscribe_to_staff<F>(&self, options: &QueryOptions, callback: F) -> Unsubscribe
    where
        F: Fn(Vec<Staff>) + Send + Sync + 'static,
    {
        self.gateway.subscribe(self.collection(), options, callback)
    }

    pub fn subscribe_to_staff_member<F>(&self, id: &str, callback: F) -> Unsubscribe
    where
        F: Fn(Option<Staff>) + Send + Sync + 'static,
    {
        self.gateway
            .subscribe_to_document(self.collection(), id, callback)
    }
}

fn name_prefix_filters(term: &str) -> Vec<SearchFilter> {
    vec![
        SearchFilter::new("name", FilterOperator::GreaterThanOrEqual, term),
        SearchFilter::new(
            "name",
            FilterOperator::LessThanOrEqual,
            format!("{term}{PREFIX_SENTINEL}"),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::InMemoryBackend;
    use crate::model::StaffRole;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn repositories() -> (InMemoryBackend, UserRepository, StaffRepository) {
        let backend = InMemoryBackend::new();
        let gateway = DocumentGateway::new(Arc::new(backend.clone()));
        (
            backend,
            UserRepository::new(gateway.clone()),
            StaffRepository::new(gateway),
        )
    }

    #[tokio::test]
    async fn user_crud_round_trip() {
        let (_, users, _) = repositories();
        let id = users
            .create_user(&NewUser::new("山田太郎", "ヤマダタロウ"))
            .await
            .unwrap();

        users
            .update_user(
                &id,
                &UserPatch {
                    care_level: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let user = users.get_user(&id).await.unwrap().unwrap();
        assert_eq!(user.name, "山田太郎");
        assert_eq!(user.care_level, 2);
        assert!(user.created_at.is_some());

        users.delete_user(&id).await.unwrap();
        assert!(users.get_user(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn search_users_matches_name_prefix() {
        let (backend, users, _) = repositories();
        backend.seed("users", "u1", json!({ "name": "山田太郎" }));
        backend.seed("users", "u2", json!({ "name": "山本花子" }));
        backend.seed("users", "u3", json!({ "name": "田中一郎" }));

        let found = users.search_users("山田").await.unwrap();
        let ids: Vec<_> = found.iter().map(|user| user.id.as_str()).collect();
        assert_eq!(ids, ["u1"]);
    }

    #[tokio::test]
    async fn active_staff_filters_inactive_members() {
        let (_, _, staff) = repositories();
        staff
            .create_staff(&NewStaff::new("佐藤", StaffRole::Caregiver))
            .await
            .unwrap();
        staff
            .create_staff(&NewStaff {
                is_active: false,
                ..NewStaff::new("鈴木", StaffRole::Nurse)
            })
            .await
            .unwrap();

        let active = staff.get_active_staff().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "佐藤");
    }

    #[test]
    fn subscribe_to_user_tracks_a_single_document() {
        let (backend, users, _) = repositories();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let unsubscribe = users.subscribe_to_user("u1", move |user| {
            sink.lock()
                .unwrap()
                .push(user.map(|user| user.name));
        });

        backend.seed("users", "u1", json!({ "name": "山田" }));
        backend.seed("users", "u2", json!({ "name": "田中" }));
        unsubscribe();
        backend.seed("users", "u1", json!({ "name": "山田二郎" }));

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[None, Some("山田".to_string())]
        );
    }
}
