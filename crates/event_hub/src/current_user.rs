use std::future::Future;

use shared::domain::UserId;

tokio::task_local! {
    static CURRENT_USER: UserId;
}

/// Runs `fut` with `user_id` as the acting identity visible to [`current_user`].
pub async fn scope_current_user<F: Future>(user_id: UserId, fut: F) -> F::Output {
    CURRENT_USER.scope(user_id, fut).await
}

pub fn current_user() -> Option<UserId> {
    CURRENT_USER.try_with(|user_id| *user_id).ok()
}
