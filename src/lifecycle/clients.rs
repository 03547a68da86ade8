use std::sync::Mutex;
use url::Url;

use crate::cache::CacheGeneration;
use crate::error::{OfflineError, Result};

/// An open application page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientPage {
  pub id: String,
  pub url: Url,
  /// Build (static generation) currently controlling this page, if any
  pub controller: Option<CacheGeneration>,
}

/// Registry of open pages, as reported by the host.
#[derive(Debug, Default)]
pub struct Clients {
  pages: Mutex<Vec<ClientPage>>,
}

impl Clients {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<ClientPage>>> {
    self
      .pages
      .lock()
      .map_err(|e| OfflineError::InvalidState(format!("Client registry lock poisoned: {}", e)))
  }

  /// Track a page; replaces an existing page with the same id.
  pub fn add(&self, page: ClientPage) -> Result<()> {
    let mut pages = self.lock()?;
    pages.retain(|p| p.id != page.id);
    pages.push(page);
    Ok(())
  }

  pub fn remove(&self, id: &str) -> Result<Option<ClientPage>> {
    let mut pages = self.lock()?;
    let pos = pages.iter().position(|p| p.id == id);
    Ok(pos.map(|i| pages.remove(i)))
  }

  pub fn list(&self) -> Result<Vec<ClientPage>> {
    Ok(self.lock()?.clone())
  }

  /// Whether any open page is controlled by a build other than `version`.
  pub fn controlled_by_other(&self, version: &CacheGeneration) -> Result<bool> {
    Ok(
      self
        .lock()?
        .iter()
        .any(|p| p.controller.as_ref().is_some_and(|c| c != version)),
    )
  }

  /// Take control of every open page. Returns how many pages changed controller.
  pub fn claim(&self, version: &CacheGeneration) -> Result<usize> {
    let mut pages = self.lock()?;
    let mut claimed = 0;
    for page in pages.iter_mut() {
      if page.controller.as_ref() != Some(version) {
        page.controller = Some(version.clone());
        claimed += 1;
      }
    }
    Ok(claimed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn page(id: &str, controller: Option<&str>) -> ClientPage {
    ClientPage {
      id: id.to_string(),
      url: Url::parse("http://localhost:3000/index.html").unwrap(),
      controller: controller.map(CacheGeneration::from),
    }
  }

  #[test]
  fn test_claim_takes_over_every_page() {
    let clients = Clients::new();
    clients.add(page("a", Some("static-v1"))).unwrap();
    clients.add(page("b", None)).unwrap();
    clients.add(page("c", Some("static-v2"))).unwrap();

    let v2 = CacheGeneration::new("static-v2");
    assert!(clients.controlled_by_other(&v2).unwrap());
    assert_eq!(clients.claim(&v2).unwrap(), 2);
    assert!(!clients.controlled_by_other(&v2).unwrap());
    assert!(clients
      .list()
      .unwrap()
      .iter()
      .all(|p| p.controller.as_ref() == Some(&v2)));
  }

  #[test]
  fn test_add_replaces_and_remove() {
    let clients = Clients::new();
    clients.add(page("a", None)).unwrap();
    clients.add(page("a", Some("static-v1"))).unwrap();
    assert_eq!(clients.list().unwrap().len(), 1);
    assert!(clients.remove("a").unwrap().is_some());
    assert!(clients.remove("a").unwrap().is_none());
  }
}
